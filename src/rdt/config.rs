// rdt/config.rs

#![forbid(unsafe_code)]

use std::time::Duration;

use crate::rdt::common::{
    Algorithm, TransferError, DEFAULT_CHUNK_SIZE, DEFAULT_INITIAL_SSTHRESH, DEFAULT_RECEIVE_WINDOW,
    INITIAL_RTO_MS, MAX_RTO_MS, MIN_RTO_MS, MIN_SSTHRESH,
};

/// Tunables shared by client and server sessions.
///
/// Both peers only need to agree on `chunk_size` implicitly: the receiver never
/// checks segment length against its own setting, so a server with a different
/// chunk size still accepts uploads.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Payload bytes per DATA segment
    pub chunk_size: usize,

    /// How long the initiator keeps resending its opening message
    pub handshake_timeout: Duration,
    pub handshake_retry_interval: Duration,

    /// Bounded wait used for every receive; doubles as the RTO poll period
    pub poll_interval: Duration,

    /// Timeouts one segment may suffer before the session is aborted
    pub max_retries: u32,

    /// FIN attempts before a side force-closes
    pub fin_retries: u32,
    pub fin_retry_interval: Duration,

    /// Silence after which a receiving session is abandoned.
    /// Must outlast `max_rto_ms` plus one poll interval.
    pub idle_timeout: Duration,

    /// How long the server remembers closed sessions to re-ack late FINs
    pub tombstone_ttl: Duration,

    /// Segments the receiver advertises it can buffer
    pub receive_window: u32,

    pub initial_ssthresh: f64,
    pub initial_rto_ms: f64,
    /// RTO ceiling; also the longest a sender may stay silent while backing off
    pub max_rto_ms: f64,
    pub algorithm: Algorithm,

    /// Probability that the sender withholds a segment from the wire (diagnostics only)
    pub loss_rate: f64,

    /// Capacity of each server session's inbox
    pub session_inbox: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout: Duration::from_secs(5),
            handshake_retry_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(150),
            max_retries: 5,
            fin_retries: 5,
            fin_retry_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            tombstone_ttl: Duration::from_secs(10),
            receive_window: DEFAULT_RECEIVE_WINDOW,
            initial_ssthresh: DEFAULT_INITIAL_SSTHRESH,
            initial_rto_ms: INITIAL_RTO_MS,
            max_rto_ms: MAX_RTO_MS,
            algorithm: Algorithm::Tahoe,
            loss_rate: 0.0,
            session_inbox: 256,
        }
    }
}

impl TransferConfig {
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        // A DATA datagram is JSON with a base64 payload (4/3 expansion) and must fit one read
        if self.chunk_size == 0 || self.chunk_size > 32 * 1024 {
            return Err(TransferError::InvalidConfig(format!(
                "chunk_size must be in 1..=32768, was {}",
                self.chunk_size
            )));
        }
        if self.receive_window == 0 {
            return Err(TransferError::InvalidConfig("receive_window must be positive".into()));
        }
        if self.initial_ssthresh < MIN_SSTHRESH {
            return Err(TransferError::InvalidConfig(format!(
                "initial_ssthresh must be at least {MIN_SSTHRESH}"
            )));
        }
        if !(MIN_RTO_MS..=MAX_RTO_MS).contains(&self.max_rto_ms) {
            return Err(TransferError::InvalidConfig(format!(
                "max_rto_ms must be within {MIN_RTO_MS}..={MAX_RTO_MS}"
            )));
        }
        if !(MIN_RTO_MS..=self.max_rto_ms).contains(&self.initial_rto_ms) {
            return Err(TransferError::InvalidConfig(format!(
                "initial_rto_ms must be within {MIN_RTO_MS}..={}",
                self.max_rto_ms
            )));
        }
        if !(0.0..1.0).contains(&self.loss_rate) {
            return Err(TransferError::InvalidConfig("loss_rate must be in [0, 1)".into()));
        }
        if self.poll_interval.is_zero() || self.handshake_retry_interval.is_zero() {
            return Err(TransferError::InvalidConfig("wait intervals must be non-zero".into()));
        }
        // A receiver must not give up on a sender that is still backing off
        let sender_silence = Duration::from_secs_f64(self.max_rto_ms / 1000.0) + self.poll_interval;
        if self.idle_timeout <= sender_silence {
            return Err(TransferError::InvalidConfig(format!(
                "idle_timeout must exceed {} ms (max_rto_ms plus poll_interval)",
                sender_silence.as_millis()
            )));
        }
        if self.fin_retries == 0 {
            return Err(TransferError::InvalidConfig("fin_retries must be at least 1".into()));
        }
        if self.session_inbox == 0 {
            return Err(TransferError::InvalidConfig("session_inbox must be positive".into()));
        }
        Ok(())
    }
}
