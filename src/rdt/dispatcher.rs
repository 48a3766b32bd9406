// rdt/dispatcher.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::rdt::common::{Algorithm, ErrorCode, MAX_DATAGRAM_SIZE, Role, SessionKey, TransferError};
use crate::rdt::config::TransferConfig;
use crate::rdt::congestion::CongestionController;
use crate::rdt::link::{ChannelLink, Link};
use crate::rdt::metrics::MetricsSink;
use crate::rdt::packet::Message;
use crate::rdt::receiver::Receiver;
use crate::rdt::sender::Sender;
use crate::rdt::session::{Session, local_role};
use crate::rdt::storage::{FileStore, RoomDirectory, validate_filename};

/// Interval at which expired tombstones are purged
const TOMBSTONE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Capacity of the dispatcher command channel
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Commands that can be sent to the dispatcher
#[derive(Debug)]
pub enum DispatcherCommand {
    /// A session task ended; its registry entry can go
    SessionFinished { key: SessionKey, id: u64 },
    /// Abort every session and stop the receive loop
    Shutdown,
}

/// Registry entry for one live session
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    role: Role,
    inbox: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

type Registry = Arc<RwLock<HashMap<SessionKey, SessionHandle>>>;

/// Owns the shared socket and routes every datagram to its session task.
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    sessions: Registry,
    /// Closed sessions, kept so a late FIN is still acknowledged
    tombstones: HashMap<SessionKey, Instant>,
    rooms: Arc<dyn RoomDirectory>,
    store: Arc<dyn FileStore>,
    metrics: Arc<dyn MetricsSink>,
    config: TransferConfig,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    command_tx: mpsc::Sender<DispatcherCommand>,
    next_session_id: u64,
}

impl Dispatcher {
    pub async fn new(
        bind_addr: SocketAddr,
        config: TransferConfig,
        rooms: Arc<dyn RoomDirectory>,
        store: Arc<dyn FileStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        let socket = UdpSocket::bind(bind_addr).await?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        Ok(Self {
            socket: Arc::new(socket),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tombstones: HashMap::new(),
            rooms,
            store,
            metrics,
            config,
            command_rx,
            command_tx,
            next_session_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn command_sender(&self) -> mpsc::Sender<DispatcherCommand> {
        self.command_tx.clone()
    }

    /// Runs until `Shutdown` arrives
    pub async fn run(&mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut sweep = time::interval(TOMBSTONE_SWEEP_INTERVAL);
        info!(addr = ?self.socket.local_addr().ok(), "dispatcher running");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(DispatcherCommand::SessionFinished { key, id }) => {
                            self.handle_finished(key, id).await;
                        }
                        // The dispatcher holds a sender itself, so `None` cannot happen
                        Some(DispatcherCommand::Shutdown) | None => {
                            self.shutdown_sessions().await;
                            break;
                        }
                    }
                }
                recv_result = self.socket.recv_from(&mut buf) => {
                    match recv_result {
                        Ok((size, peer)) => self.handle_incoming(&buf[..size], peer).await,
                        // ICMP feedback for an earlier reply
                        Err(e) if e.kind() == ErrorKind::ConnectionRefused || e.kind() == ErrorKind::ConnectionReset => {
                            trace!("peer unreachable: {}", e);
                        }
                        Err(e) => {
                            error!("Socket receive failed: {}", e);
                            time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.tombstones.retain(|_, expires| *expires > now);
                }
            }
        }
        info!("dispatcher stopped");
    }

    async fn handle_incoming(&mut self, data: &[u8], peer: SocketAddr) {
        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, "Dropping datagram: {}", e);
                return;
            }
        };
        let key = msg.session_key(peer);

        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&key) {
                if msg.is_opening() && local_role(&msg, false) != Some(handle.role) {
                    debug!(%key, kind = msg.kind(), "opening message conflicts with live session, dropped");
                    return;
                }
                match handle.inbox.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        trace!(%key, kind = msg.kind(), "session inbox full, dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!(%key, "session already finishing");
                    }
                }
                return;
            }
        }

        match msg {
            Message::Syn { total, algo, .. } => self.open_upload(key, total, algo).await,
            Message::Download { algo, .. } => self.open_download(key, algo).await,
            Message::Fin { .. } => {
                if self.tombstones.get(&key).is_some_and(|expires| *expires > Instant::now()) {
                    debug!(%key, "late FIN for closed session");
                    self.reply(&Message::fin_ack(&key.room, &key.filename), peer).await;
                } else {
                    trace!(%key, "FIN for unknown session dropped");
                }
            }
            other => trace!(%key, kind = other.kind(), "{}, dropped", TransferError::UnknownSession),
        }
    }

    async fn reply(&self, msg: &Message, peer: SocketAddr) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Unable to encode reply: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, peer).await {
            debug!(%peer, "Reply failed: {}", e);
        }
    }

    async fn reject(&self, key: &SessionKey, code: ErrorCode, msg: String) {
        info!(%key, ?code, %msg, "rejecting transfer");
        self.reply(&Message::error(&key.room, &key.filename, code, msg), key.peer).await;
    }

    /// Room check shared by both opening messages
    async fn admit(&self, key: &SessionKey) -> bool {
        if !self.rooms.room_exists(&key.room).await {
            let reason = TransferError::RoomNotFound(key.room.to_string()).to_string();
            self.reject(key, ErrorCode::RoomNotFound, reason).await;
            return false;
        }
        true
    }

    async fn open_upload(&mut self, key: SessionKey, total: u32, algo: Algorithm) {
        if !self.admit(&key).await {
            return;
        }
        if let Err(e) = validate_filename(&key.filename) {
            self.reject(&key, ErrorCode::Internal, e.to_string()).await;
            return;
        }

        let (id, inbox, link) = self.prepare(&key);
        let session = Session::new(link, key.clone(), self.config.clone(), self.metrics.clone())
            .with_opening_reply(Message::syn_ack(&key.room, &key.filename, total));
        let receiver = Receiver::new(total, self.config.receive_window);
        let store = self.store.clone();
        let done = self.command_tx.clone();
        let task_key = key.clone();
        info!(%key, total, %algo, "upload session opened");

        let task = tokio::spawn(async move {
            let outcome = async {
                let mut session = session;
                session.accept().await?;
                let (data, report) = session.drive_receiver(receiver, None).await?;
                store.write(&task_key.room, &task_key.filename, &data).await?;
                Ok::<_, TransferError>(report)
            }
            .await;
            match outcome {
                Ok(report) => info!(key = %task_key, bytes = report.bytes, clean_close = report.clean_close, "upload stored"),
                Err(e) => warn!(key = %task_key, "Upload failed: {}", e),
            }
            let _ = done.send(DispatcherCommand::SessionFinished { key: task_key, id }).await;
        });
        self.register(key, id, Role::Receiver, inbox, task).await;
    }

    async fn open_download(&mut self, key: SessionKey, algo: Algorithm) {
        if !self.admit(&key).await {
            return;
        }

        let (id, inbox, link) = self.prepare(&key);
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let store = self.store.clone();
        let done = self.command_tx.clone();
        let task_key = key.clone();
        info!(%key, %algo, "download session opened");

        // The file is read inside the task so the receive loop keeps running
        let task = tokio::spawn(async move {
            let outcome = async {
                let data = match store.read(&task_key.room, &task_key.filename).await {
                    Ok(data) => data,
                    Err(e) => {
                        let code = match e {
                            TransferError::FileNotFound { .. } | TransferError::InvalidFilename(_) => {
                                ErrorCode::FileNotFound
                            }
                            _ => ErrorCode::Internal,
                        };
                        link.send(&Message::error(&task_key.room, &task_key.filename, code, e.to_string()))
                            .await?;
                        return Err(e);
                    }
                };
                let cc = CongestionController::from_config(&config, algo);
                let sender = Sender::new(data, config.chunk_size, cc).with_loss_rate(config.loss_rate);
                let mut session = Session::new(link, task_key.clone(), config, metrics)
                    .with_opening_reply(Message::syn_ack(&task_key.room, &task_key.filename, sender.total()));
                session.accept().await?;
                session.drive_sender(sender).await
            }
            .await;
            match outcome {
                Ok(report) => info!(key = %task_key, bytes = report.bytes, clean_close = report.clean_close, "download served"),
                Err(e) => warn!(key = %task_key, "Download failed: {}", e),
            }
            let _ = done.send(DispatcherCommand::SessionFinished { key: task_key, id }).await;
        });
        self.register(key, id, Role::Sender, inbox, task).await;
    }

    fn prepare(&mut self, key: &SessionKey) -> (u64, mpsc::Sender<Message>, ChannelLink) {
        self.next_session_id += 1;
        self.tombstones.remove(key);
        let (tx, rx) = mpsc::channel(self.config.session_inbox);
        (self.next_session_id, tx, ChannelLink::new(rx, self.socket.clone(), key.peer))
    }

    async fn register(&self, key: SessionKey, id: u64, role: Role, inbox: mpsc::Sender<Message>, task: JoinHandle<()>) {
        self.sessions.write().await.insert(key, SessionHandle { id, role, inbox, task });
    }

    async fn handle_finished(&mut self, key: SessionKey, id: u64) {
        let mut sessions = self.sessions.write().await;
        // A newer session may already own the key
        if sessions.get(&key).is_some_and(|handle| handle.id == id) {
            sessions.remove(&key);
            debug!(%key, "session released");
            self.tombstones.insert(key, Instant::now() + self.config.tombstone_ttl);
        }
    }

    async fn shutdown_sessions(&mut self) {
        let mut sessions = self.sessions.write().await;
        for (key, handle) in sessions.drain() {
            debug!(%key, "aborting session");
            handle.task.abort();
        }
        self.tombstones.clear();
    }
}

/// A running dispatcher on its own task
pub struct Server {
    local_addr: SocketAddr,
    command_tx: mpsc::Sender<DispatcherCommand>,
    sessions: Registry,
    task: JoinHandle<()>,
}

impl Server {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: TransferConfig,
        rooms: Arc<dyn RoomDirectory>,
        store: Arc<dyn FileStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, TransferError> {
        let mut dispatcher = Dispatcher::new(bind_addr, config, rooms, store, metrics).await?;
        let local_addr = dispatcher.local_addr()?;
        let command_tx = dispatcher.command_sender();
        let sessions = dispatcher.sessions.clone();
        let task = tokio::spawn(async move { dispatcher.run().await });
        Ok(Self { local_addr, command_tx, sessions, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Aborts all sessions and waits for the receive loop to exit
    pub async fn shutdown(self) -> Result<(), TransferError> {
        self.command_tx
            .send(DispatcherCommand::Shutdown)
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        self.task.await.map_err(|e| TransferError::Storage(format!("dispatcher task failed: {e}")))?;
        Ok(())
    }
}
