// rdt/link.rs

#![forbid(unsafe_code)]

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

use crate::rdt::common::{MAX_DATAGRAM_SIZE, RoomCode, TransferError};
use crate::rdt::packet::Message;

/// The datagram path one session talks through.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, msg: &Message) -> Result<(), TransferError>;

    /// Waits at most `wait` for the next message of this session.
    /// `Ok(None)` means the wait elapsed.
    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, TransferError>;
}

/// Client side: a UDP socket connected to the server, filtered to one room/file
pub struct UdpLink {
    socket: UdpSocket,
    room: RoomCode,
    filename: String,
    buf: Vec<u8>,
}

impl UdpLink {
    pub async fn connect(server: SocketAddr, room: RoomCode, filename: impl Into<String>) -> Result<Self, TransferError> {
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        debug!(local = ?socket.local_addr().ok(), %server, "client socket connected");
        Ok(Self { socket, room, filename: filename.into(), buf: vec![0u8; MAX_DATAGRAM_SIZE] })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send(&self, msg: &Message) -> Result<(), TransferError> {
        let bytes = msg.encode()?;
        match self.socket.send(&bytes).await {
            Ok(_) => Ok(()),
            // ICMP unreachable from an earlier datagram; same as loss
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                trace!("send refused by peer");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, TransferError> {
        let deadline = Instant::now() + wait;
        loop {
            let n = match timeout_at(deadline, self.socket.recv(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    trace!("peer unreachable");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            match Message::decode(&self.buf[..n]) {
                Ok(msg) if msg.belongs_to(&self.room, &self.filename) => return Ok(Some(msg)),
                Ok(msg) => trace!(kind = msg.kind(), "datagram for another transfer dropped"),
                Err(e) => debug!("Dropping datagram: {}", e),
            }
        }
    }
}

/// Server side: messages arrive through the dispatcher, replies go out on the shared socket
pub struct ChannelLink {
    inbox: mpsc::Receiver<Message>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl ChannelLink {
    pub fn new(inbox: mpsc::Receiver<Message>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { inbox, socket, peer }
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn send(&self, msg: &Message) -> Result<(), TransferError> {
        let bytes = msg.encode()?;
        self.socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, TransferError> {
        match timeout(wait, self.inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransferError::ChannelClosed),
        }
    }
}
