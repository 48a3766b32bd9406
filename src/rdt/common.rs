// rdt/common.rs

#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default payload bytes carried by one DATA segment
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Retransmission timeout bounds (milliseconds)
pub const MIN_RTO_MS: f64 = 200.0;
pub const MAX_RTO_MS: f64 = 30_000.0;
pub const INITIAL_RTO_MS: f64 = 1_000.0;

/// Window floors
pub const MIN_CWND: f64 = 1.0;
pub const MIN_SSTHRESH: f64 = 2.0;
pub const DEFAULT_INITIAL_SSTHRESH: f64 = 16.0;

/// EWMA gains for the RTT estimator (RFC 6298)
pub const RTT_ALPHA: f64 = 0.125;
pub const RTT_BETA: f64 = 0.25;

/// Window management constants
pub const DUPLICATE_ACKS_BEFORE_RESEND: u32 = 3;
pub const DEFAULT_RECEIVE_WINDOW: u32 = 64;

/// Largest datagram we are prepared to read
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshaking,
    Transferring,
    Terminating,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Transferring => "TRANSFERRING",
            SessionState::Terminating => "TERMINATING",
            SessionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Congestion-control policy selected per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Tahoe,
    Reno,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Tahoe => "tahoe",
            Algorithm::Reno => "reno",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the transfer the local side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// A 4-digit room code. Construction is the only place the format is checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(RoomCode(s.to_string()))
        } else {
            Err(TransferError::InvalidRoomCode(s.to_string()))
        }
    }
}

impl TryFrom<String> for RoomCode {
    type Error = TransferError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one transfer attempt on the shared socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub room: RoomCode,
    pub filename: String,
    pub peer: SocketAddr,
}

impl SessionKey {
    pub fn new(room: RoomCode, filename: impl Into<String>, peer: SocketAddr) -> Self {
        Self { room, filename: filename.into(), peer }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.room, self.filename, self.peer)
    }
}

/// Reason codes carried by ERROR messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    FileNotFound,
    Busy,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Segment {seq} exceeded {retries} retransmissions")]
    SegmentRetryExceeded { seq: u32, retries: u32 },
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Datagram matches no session")]
    UnknownSession,
    #[error("Room {0} not found")]
    RoomNotFound(String),
    #[error("File {filename} not found in room {room}")]
    FileNotFound { room: String, filename: String },
    #[error("Termination handshake timed out")]
    TerminationTimeout,
    #[error("Peer rejected transfer ({code:?}): {msg}")]
    Rejected { code: ErrorCode, msg: String },
    #[error("Session idle for too long")]
    IdleTimeout,
    #[error("Transfer incomplete: {received} of {total} segments")]
    IncompleteTransfer { received: u32, total: u32 },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid room code {0:?}")]
    InvalidRoomCode(String),
    #[error("Invalid filename {0:?}")]
    InvalidFilename(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Session channel closed")]
    ChannelClosed,
}

impl TransferError {
    /// Maps an ERROR message received from the peer onto the local taxonomy
    pub fn from_peer(code: ErrorCode, room: &RoomCode, filename: &str, msg: String) -> Self {
        match code {
            ErrorCode::RoomNotFound => TransferError::RoomNotFound(room.to_string()),
            ErrorCode::FileNotFound => TransferError::FileNotFound {
                room: room.to_string(),
                filename: filename.to_string(),
            },
            other => TransferError::Rejected { code: other, msg },
        }
    }
}

/// Summary of one finished transfer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferReport {
    pub bytes: usize,
    pub segments: u32,
    pub fast_retransmits: u64,
    pub timeouts: u64,
    pub dropped_by_loss_knob: u64,
    pub final_cwnd: f64,
    pub final_ssthresh: f64,
    pub srtt_ms: Option<f64>,
    pub elapsed: Duration,
    pub clean_close: bool,
}

/// Number of segments needed to carry `len` bytes in `chunk_size` pieces
pub fn segment_count(len: usize, chunk_size: usize) -> u32 {
    len.div_ceil(chunk_size.max(1)) as u32
}

/// Wall-clock milliseconds since the unix epoch, for metrics timestamps
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
