// rdt/session.rs

#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::rdt::common::{Role, SessionKey, SessionState, TransferError, TransferReport};
use crate::rdt::config::TransferConfig;
use crate::rdt::link::Link;
use crate::rdt::metrics::{MetricEvent, MetricsRecord, MetricsSink};
use crate::rdt::packet::{Message, Segment};
use crate::rdt::receiver::Receiver;
use crate::rdt::sender::{AckKind, Sender};

/// How the responder confirmed the opening message
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    /// SYN-ACK carrying the segment count
    Accepted { total: u32 },
    /// A download started straight away; the segment must not be lost
    FirstData(Message),
}

impl Handshake {
    pub fn total(&self) -> u32 {
        match self {
            Handshake::Accepted { total } => *total,
            Handshake::FirstData(Message::Data { total, .. }) => *total,
            Handshake::FirstData(_) => 0,
        }
    }
}

/// Drives one transfer over a `Link`, from handshake to close.
///
/// A session plays exactly one role: `drive_sender` or `drive_receiver` is
/// called once and consumes the corresponding state machine.
pub struct Session<L: Link> {
    link: L,
    key: SessionKey,
    config: TransferConfig,
    metrics: Arc<dyn MetricsSink>,
    state: SessionState,
    opening_reply: Option<Message>,
}

impl<L: Link> Session<L> {
    pub fn new(link: L, key: SessionKey, config: TransferConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { link, key, config, metrics, state: SessionState::Init, opening_reply: None }
    }

    /// Message re-sent whenever a duplicate opening message shows up
    pub fn with_opening_reply(mut self, reply: Message) -> Self {
        self.opening_reply = Some(reply);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(key = %self.key, from = %self.state, to = %next, "session state change");
            self.state = next;
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), TransferError> {
        trace!(key = %self.key, kind = msg.kind(), "send");
        self.link.send(msg).await
    }

    async fn send_segment(&self, segment: &Segment) -> Result<(), TransferError> {
        self.send(&Message::data(&self.key.room, &self.key.filename, segment)).await
    }

    async fn echo_opening(&self) -> Result<(), TransferError> {
        match &self.opening_reply {
            Some(reply) => self.send(reply).await,
            None => Ok(()),
        }
    }

    /// Responder side: confirms the opening message with the configured reply
    pub async fn accept(&mut self) -> Result<(), TransferError> {
        self.transition(SessionState::Handshaking);
        self.echo_opening().await?;
        self.transition(SessionState::Transferring);
        Ok(())
    }

    /// Initiator side: repeats `opening` until the responder confirms or the deadline passes
    pub async fn handshake(&mut self, opening: &Message) -> Result<Handshake, TransferError> {
        self.transition(SessionState::Handshaking);
        let accepts_data = matches!(opening, Message::Download { .. });
        let deadline = Instant::now() + self.config.handshake_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(key = %self.key, "handshake timed out");
                self.transition(SessionState::Closed);
                return Err(TransferError::HandshakeTimeout);
            }
            self.send(opening).await?;
            let resend_at = (now + self.config.handshake_retry_interval).min(deadline);

            loop {
                let wait = resend_at.saturating_duration_since(Instant::now());
                if wait.is_zero() {
                    break;
                }
                match self.link.recv(wait).await? {
                    None => break,
                    Some(Message::SynAck { total, .. }) => {
                        info!(key = %self.key, total, "handshake complete");
                        self.transition(SessionState::Transferring);
                        return Ok(Handshake::Accepted { total });
                    }
                    Some(Message::Error { code, msg, .. }) => {
                        warn!(key = %self.key, ?code, %msg, "transfer rejected by peer");
                        self.transition(SessionState::Closed);
                        return Err(TransferError::from_peer(code, &self.key.room, &self.key.filename, msg));
                    }
                    Some(data @ Message::Data { .. }) if accepts_data => {
                        info!(key = %self.key, "handshake confirmed by first segment");
                        self.transition(SessionState::Transferring);
                        return Ok(Handshake::FirstData(data));
                    }
                    Some(other) => trace!(kind = other.kind(), "ignored during handshake"),
                }
            }
        }
    }

    fn record(&self, sender: &Sender, event: MetricEvent, seq: u32, rtt_sample_ms: Option<f64>) {
        let bytes = if seq == 0 { 0 } else { sender.segment(seq).payload.len() };
        self.metrics
            .record(MetricsRecord::snapshot(&self.key, event, seq, bytes, rtt_sample_ms, sender.controller()));
    }

    /// Pushes the whole payload through the window, then terminates.
    pub async fn drive_sender(mut self, mut sender: Sender) -> Result<TransferReport, TransferError> {
        self.transition(SessionState::Transferring);
        let started = Instant::now();
        let mut next_seq = 1;
        let mut rwnd = self.config.receive_window;
        let mut peer_closed = false;
        info!(key = %self.key, total = sender.total(), algorithm = %sender.controller().algorithm(), "sending");

        while !sender.is_done() {
            let batch = sender.send_window(next_seq, sender.window_base(), rwnd, Instant::now());
            next_seq = batch.next_seq;
            for segment in &batch.segments {
                self.send_segment(segment).await?;
            }

            match self.link.recv(self.config.poll_interval).await? {
                Some(Message::Ack { ack, rwnd: advertised, .. }) => {
                    rwnd = advertised.max(1);
                    let outcome = sender.on_ack(ack, Instant::now());
                    match outcome.kind {
                        AckKind::New => self.record(&sender, MetricEvent::Ack, ack, outcome.rtt_sample_ms),
                        AckKind::Duplicate => self.record(&sender, MetricEvent::DupAck, ack, outcome.rtt_sample_ms),
                        AckKind::Stale => self.record(&sender, MetricEvent::StaleAck, ack, outcome.rtt_sample_ms),
                    }
                    if let Some(segment) = outcome.retransmit {
                        self.record(&sender, MetricEvent::FastRetransmit, segment.seq, None);
                        self.send_segment(&segment).await?;
                    }
                }
                Some(Message::Fin { .. }) => {
                    // Receiver holds everything even if its last ACK went missing
                    debug!(key = %self.key, "peer finished first");
                    self.send(&Message::fin_ack(&self.key.room, &self.key.filename)).await?;
                    peer_closed = true;
                    break;
                }
                Some(Message::Error { code, msg, .. }) => {
                    self.transition(SessionState::Closed);
                    return Err(TransferError::from_peer(code, &self.key.room, &self.key.filename, msg));
                }
                Some(msg) if msg.is_opening() => self.echo_opening().await?,
                Some(other) => trace!(kind = other.kind(), "ignored while sending"),
                None => {}
            }

            let base = sender.window_base();
            match sender.check_timeout(base, self.config.max_retries, Instant::now()) {
                Ok(Some(segment)) => {
                    self.record(&sender, MetricEvent::Timeout, segment.seq, None);
                    self.send_segment(&segment).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    self.transition(SessionState::Closed);
                    return Err(e);
                }
            }
        }

        let clean_close = if peer_closed {
            self.transition(SessionState::Closed);
            true
        } else {
            self.terminate(None).await?
        };
        let cc = sender.controller();
        let report = TransferReport {
            bytes: sender.payload_len(),
            segments: sender.total(),
            fast_retransmits: sender.fast_retransmits(),
            timeouts: sender.timeouts(),
            dropped_by_loss_knob: sender.dropped_by_loss_knob(),
            final_cwnd: cc.cwnd(),
            final_ssthresh: cc.ssthresh(),
            srtt_ms: cc.srtt_ms(),
            elapsed: started.elapsed(),
            clean_close,
        };
        info!(
            key = %self.key,
            bytes = report.bytes,
            fast_retransmits = report.fast_retransmits,
            timeouts = report.timeouts,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "send complete"
        );
        Ok(report)
    }

    /// Collects segments until the stream is whole, then terminates and reassembles.
    ///
    /// `pending` is a DATA message that arrived before the receive loop started.
    pub async fn drive_receiver(
        mut self,
        mut receiver: Receiver,
        pending: Option<Message>,
    ) -> Result<(Vec<u8>, TransferReport), TransferError> {
        self.transition(SessionState::Transferring);
        let started = Instant::now();
        let mut last_heard = Instant::now();
        let mut early_fin = false;
        let mut next = pending;
        info!(key = %self.key, total = receiver.total(), "receiving");

        while !receiver.is_complete() {
            let msg = match next.take() {
                Some(msg) => Some(msg),
                None => self.link.recv(self.config.poll_interval).await?,
            };
            match msg {
                Some(Message::Data { seq, payload, .. }) => {
                    last_heard = Instant::now();
                    let ack = receiver.add_chunk(seq, payload);
                    self.send(&Message::ack(&self.key.room, &self.key.filename, ack, receiver.rwnd()))
                        .await?;
                }
                Some(Message::Fin { .. }) => {
                    self.send(&Message::fin_ack(&self.key.room, &self.key.filename)).await?;
                    early_fin = true;
                    break;
                }
                Some(Message::Error { code, msg, .. }) => {
                    self.transition(SessionState::Closed);
                    return Err(TransferError::from_peer(code, &self.key.room, &self.key.filename, msg));
                }
                Some(msg) if msg.is_opening() => {
                    last_heard = Instant::now();
                    self.echo_opening().await?;
                }
                Some(other) => trace!(kind = other.kind(), "ignored while receiving"),
                None => {
                    if last_heard.elapsed() >= self.config.idle_timeout {
                        warn!(key = %self.key, received = receiver.received(), total = receiver.total(), "session idle, abandoning");
                        self.transition(SessionState::Closed);
                        return Err(TransferError::IdleTimeout);
                    }
                }
            }
        }

        let clean_close = if early_fin {
            self.transition(SessionState::Closed);
            true
        } else {
            let final_ack = Message::ack(&self.key.room, &self.key.filename, receiver.ack(), receiver.rwnd());
            self.terminate(Some(final_ack)).await?
        };

        let segments = receiver.total();
        let data = receiver.finalize()?;
        let report = TransferReport {
            bytes: data.len(),
            segments,
            elapsed: started.elapsed(),
            clean_close,
            ..Default::default()
        };
        info!(key = %self.key, bytes = report.bytes, elapsed_ms = report.elapsed.as_millis() as u64, "receive complete");
        Ok((data, report))
    }

    /// Sends FIN until FIN-ACK (or the peer's own FIN) arrives.
    ///
    /// Returns whether the close was acknowledged. `final_ack` is repeated to
    /// a sender that is still retransmitting.
    async fn terminate(&mut self, final_ack: Option<Message>) -> Result<bool, TransferError> {
        self.transition(SessionState::Terminating);
        let fin = Message::fin(&self.key.room, &self.key.filename);

        for attempt in 1..=self.config.fin_retries {
            self.send(&fin).await?;
            let deadline = Instant::now() + self.config.fin_retry_interval;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                if wait.is_zero() {
                    break;
                }
                match self.link.recv(wait).await? {
                    None => break,
                    Some(Message::FinAck { .. }) => {
                        self.transition(SessionState::Closed);
                        return Ok(true);
                    }
                    Some(Message::Fin { .. }) => {
                        self.send(&Message::fin_ack(&self.key.room, &self.key.filename)).await?;
                        self.transition(SessionState::Closed);
                        return Ok(true);
                    }
                    Some(Message::Data { .. }) => {
                        if let Some(ack) = &final_ack {
                            self.send(ack).await?;
                        }
                    }
                    Some(msg) if msg.is_opening() => self.echo_opening().await?,
                    Some(other) => trace!(kind = other.kind(), attempt, "ignored while terminating"),
                }
            }
            debug!(key = %self.key, attempt, "FIN unanswered");
        }

        warn!(key = %self.key, "{}, closing anyway", TransferError::TerminationTimeout);
        self.transition(SessionState::Closed);
        Ok(false)
    }
}

/// Which role the local side plays for an opening message
pub fn local_role(opening: &Message, initiator: bool) -> Option<Role> {
    let role = match opening {
        Message::Syn { .. } => Role::Sender,
        Message::Download { .. } => Role::Receiver,
        _ => return None,
    };
    Some(match (role, initiator) {
        (r, true) => r,
        (Role::Sender, false) => Role::Receiver,
        (Role::Receiver, false) => Role::Sender,
    })
}
