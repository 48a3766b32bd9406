// rdt/client.rs

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::info;

use crate::rdt::common::{RoomCode, SessionKey, TransferError, TransferReport};
use crate::rdt::config::TransferConfig;
use crate::rdt::congestion::CongestionController;
use crate::rdt::link::UdpLink;
use crate::rdt::metrics::{MetricsSink, NullMetrics};
use crate::rdt::packet::Message;
use crate::rdt::receiver::Receiver;
use crate::rdt::sender::Sender;
use crate::rdt::session::{Handshake, Session};
use crate::rdt::storage::validate_filename;

/// Initiates uploads and downloads against a server.
///
/// Every transfer binds its own ephemeral socket, so one `Client` can run
/// several transfers concurrently.
#[derive(Clone)]
pub struct Client {
    config: TransferConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Client {
    pub fn new(config: TransferConfig) -> Self {
        Self { config, metrics: Arc::new(NullMetrics) }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    async fn open(&self, server: SocketAddr, room: &RoomCode, filename: &str) -> Result<Session<UdpLink>, TransferError> {
        self.config.validate()?;
        validate_filename(filename)?;
        let link = UdpLink::connect(server, room.clone(), filename).await?;
        let key = SessionKey::new(room.clone(), filename, server);
        Ok(Session::new(link, key, self.config.clone(), self.metrics.clone()))
    }

    /// Sends `data` to the server as `room/filename`
    pub async fn upload(
        &self,
        server: SocketAddr,
        room: &RoomCode,
        filename: &str,
        data: Bytes,
    ) -> Result<TransferReport, TransferError> {
        let mut session = self.open(server, room, filename).await?;
        let algorithm = self.config.algorithm;
        let cc = CongestionController::from_config(&self.config, algorithm);
        let sender = Sender::new(data, self.config.chunk_size, cc).with_loss_rate(self.config.loss_rate);
        info!(%server, %room, filename, bytes = sender.payload_len(), segments = sender.total(), %algorithm, "starting upload");

        let opening = Message::Syn {
            room: room.clone(),
            filename: filename.to_string(),
            total: sender.total(),
            algo: algorithm,
        };
        session.handshake(&opening).await?;
        session.drive_sender(sender).await
    }

    /// Fetches `room/filename` from the server
    pub async fn download(
        &self,
        server: SocketAddr,
        room: &RoomCode,
        filename: &str,
    ) -> Result<(Vec<u8>, TransferReport), TransferError> {
        let mut session = self.open(server, room, filename).await?;
        info!(%server, %room, filename, algorithm = %self.config.algorithm, "starting download");

        let opening = Message::Download {
            room: room.clone(),
            filename: filename.to_string(),
            algo: self.config.algorithm,
        };
        let handshake = session.handshake(&opening).await?;
        let receiver = Receiver::new(handshake.total(), self.config.receive_window);
        let pending = match handshake {
            Handshake::FirstData(data) => Some(data),
            Handshake::Accepted { .. } => None,
        };
        session.drive_receiver(receiver, pending).await
    }
}
