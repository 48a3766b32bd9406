// rdt/sender.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::rdt::common::{TransferError, segment_count};
use crate::rdt::congestion::{Action, CongestionController};
use crate::rdt::packet::Segment;

/// Per-segment transmission record
#[derive(Debug, Clone)]
struct SentSegmentInfo {
    sent_at: Instant,
    transmissions: u32,
    /// Timeout-driven resends; fast retransmits do not count
    retries: u32,
    rtt_sampled: bool,
}

/// Result of one `send_window` pass
#[derive(Debug, Default)]
pub struct SendBatch {
    /// Segments that must go on the wire now
    pub segments: Vec<Segment>,
    /// First seq not yet transmitted
    pub next_seq: u32,
    /// Segments recorded as sent but withheld by the loss knob
    pub dropped: u32,
}

/// How an incoming ACK relates to the cumulative ack point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    New,
    Duplicate,
    Stale,
}

#[derive(Debug)]
pub struct AckOutcome {
    pub kind: AckKind,
    pub rtt_sample_ms: Option<f64>,
    /// Segment to put back on the wire after a triple duplicate
    pub retransmit: Option<Segment>,
}

/// Sending half of a transfer: owns the payload and the congestion controller.
pub struct Sender {
    payload: Bytes,
    chunk_size: usize,
    total: u32,
    sent: HashMap<u32, SentSegmentInfo>,
    cc: CongestionController,
    loss_rate: f64,
    fast_retransmits: u64,
    timeouts: u64,
    dropped_by_loss_knob: u64,
}

impl Sender {
    pub fn new(payload: Bytes, chunk_size: usize, cc: CongestionController) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            total: segment_count(payload.len(), chunk_size),
            payload,
            chunk_size,
            sent: HashMap::new(),
            cc,
            loss_rate: 0.0,
            fast_retransmits: 0,
            timeouts: 0,
            dropped_by_loss_knob: 0,
        }
    }

    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn last_ack(&self) -> u32 {
        self.cc.last_ack()
    }

    /// Lowest unacknowledged seq
    pub fn window_base(&self) -> u32 {
        self.cc.last_ack() + 1
    }

    pub fn is_done(&self) -> bool {
        self.cc.last_ack() >= self.total
    }

    pub fn controller(&self) -> &CongestionController {
        &self.cc
    }

    pub fn fast_retransmits(&self) -> u64 {
        self.fast_retransmits
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn dropped_by_loss_knob(&self) -> u64 {
        self.dropped_by_loss_knob
    }

    /// Slices segment `seq` out of the payload. `seq` must be in `1..=total`.
    pub fn segment(&self, seq: u32) -> Segment {
        let start = (seq.saturating_sub(1) as usize) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.payload.len());
        Segment { seq, total: self.total, payload: self.payload.slice(start.min(end)..end) }
    }

    /// Transmits every unsent seq the window allows.
    pub fn send_window(&mut self, next_seq: u32, window_base: u32, rwnd: u32, now: Instant) -> SendBatch {
        let window = self.cc.window(rwnd);
        let start = next_seq.max(window_base).max(1);
        let end = window_base.saturating_add(window - 1).min(self.total);

        let mut batch = SendBatch { next_seq: start, ..Default::default() };
        for seq in start..=end {
            if self.sent.contains_key(&seq) {
                continue;
            }
            self.sent.insert(
                seq,
                SentSegmentInfo { sent_at: now, transmissions: 1, retries: 0, rtt_sampled: false },
            );
            if self.loss_rate > 0.0 && rand::random::<f64>() < self.loss_rate {
                trace!(seq, "segment withheld by loss knob");
                self.dropped_by_loss_knob += 1;
                batch.dropped += 1;
            } else {
                batch.segments.push(self.segment(seq));
            }
        }
        if end >= start {
            batch.next_seq = end + 1;
        }
        batch
    }

    /// Applies a cumulative ACK from the receiver.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        let ack = ack.min(self.total);
        let prev_ack = self.cc.last_ack();
        let kind = match ack.cmp(&prev_ack) {
            std::cmp::Ordering::Greater => AckKind::New,
            std::cmp::Ordering::Equal => AckKind::Duplicate,
            std::cmp::Ordering::Less => AckKind::Stale,
        };

        // Karn: only a segment sent exactly once gives an unambiguous sample, and an
        // ack that also covers a resent hole was held back by that hole
        let covers_resend = (prev_ack + 1..=ack)
            .any(|seq| self.sent.get(&seq).is_some_and(|info| info.transmissions > 1));
        let rtt_sample_ms = match self.sent.get_mut(&ack) {
            Some(info) if info.transmissions == 1 && !info.rtt_sampled && !covers_resend => {
                info.rtt_sampled = true;
                Some(now.saturating_duration_since(info.sent_at).as_secs_f64() * 1000.0)
            }
            _ => None,
        };

        let retransmit = match self.cc.on_ack(ack, rtt_sample_ms) {
            Action::None => None,
            Action::Retransmit(seq) if seq <= self.total => {
                if let Some(info) = self.sent.get_mut(&seq) {
                    info.sent_at = now;
                    info.transmissions += 1;
                }
                self.fast_retransmits += 1;
                debug!(seq, "fast retransmit");
                Some(self.segment(seq))
            }
            Action::Retransmit(_) => None,
        };

        AckOutcome { kind, rtt_sample_ms, retransmit }
    }

    /// Resends `window_base` if its timer expired.
    ///
    /// Fails the session once the segment has timed out more than
    /// `max_retries` times.
    pub fn check_timeout(
        &mut self,
        window_base: u32,
        max_retries: u32,
        now: Instant,
    ) -> Result<Option<Segment>, TransferError> {
        if window_base == 0 || window_base > self.total {
            return Ok(None);
        }
        let rto_ms = self.cc.rto_ms();
        let Some(info) = self.sent.get_mut(&window_base) else {
            return Ok(None);
        };
        let elapsed_ms = now.saturating_duration_since(info.sent_at).as_secs_f64() * 1000.0;
        if elapsed_ms <= rto_ms {
            return Ok(None);
        }

        info.retries += 1;
        if info.retries > max_retries {
            warn!(seq = window_base, retries = max_retries, "segment retry limit exceeded");
            return Err(TransferError::SegmentRetryExceeded { seq: window_base, retries: max_retries });
        }
        info.sent_at = now;
        info.transmissions += 1;
        let retries = info.retries;

        self.cc.on_timeout();
        self.timeouts += 1;
        debug!(seq = window_base, retries, rto_ms = self.cc.rto_ms(), "retransmission timeout");
        Ok(Some(self.segment(window_base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use rstest::rstest;

    use crate::rdt::common::Algorithm;
    use crate::rdt::congestion::Phase;
    use crate::rdt::receiver::Receiver;

    fn sender(payload: Vec<u8>, chunk_size: usize, algorithm: Algorithm) -> Sender {
        Sender::new(Bytes::from(payload), chunk_size, CongestionController::new(algorithm, 16.0, 1000.0))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[derive(Debug, Default)]
    struct Run {
        cwnd_trace: Vec<f64>,
        dup_acks: u32,
        acks: Vec<u32>,
        /// (seq, duplicate acks seen so far) for every fast retransmit
        fast_retransmits: Vec<(u32, u32)>,
    }

    /// Lock-step rounds: one window out, every delivery acked in order.
    /// `drop_first` lists seqs whose first transmission is lost.
    fn drive(sender: &mut Sender, receiver: &mut Receiver, rwnd: u32, drop_first: &[u32]) -> Run {
        let mut run = Run::default();
        let mut now = Instant::now();
        let mut next_seq = 1;
        let mut dropped: Vec<u32> = Vec::new();

        for _ in 0..1_000 {
            if sender.is_done() {
                break;
            }
            let base = sender.window_base();
            if let Some(seg) = sender.check_timeout(base, 5, now).unwrap() {
                receiver.add_chunk(seg.seq, seg.payload);
            }
            let batch = sender.send_window(next_seq, base, rwnd, now);
            next_seq = batch.next_seq;

            let mut in_flight: VecDeque<Segment> = batch
                .segments
                .into_iter()
                .filter(|s| {
                    if drop_first.contains(&s.seq) && !dropped.contains(&s.seq) {
                        dropped.push(s.seq);
                        false
                    } else {
                        true
                    }
                })
                .collect();

            now += Duration::from_millis(10);
            while let Some(seg) = in_flight.pop_front() {
                let ack = receiver.add_chunk(seg.seq, seg.payload);
                run.acks.push(ack);
                let outcome = sender.on_ack(ack, now);
                if outcome.kind == AckKind::Duplicate {
                    run.dup_acks += 1;
                }
                run.cwnd_trace.push(sender.controller().cwnd());
                if let Some(resend) = outcome.retransmit {
                    run.fast_retransmits.push((resend.seq, run.dup_acks));
                    in_flight.push_back(resend);
                }
            }
        }
        run
    }

    #[test]
    fn test_segmentation() {
        let sender = sender(pattern(10_000), 4096, Algorithm::Tahoe);
        assert_eq!(sender.total(), 3);
        assert_eq!(sender.segment(1).payload.len(), 4096);
        assert_eq!(sender.segment(3).payload.len(), 10_000 - 8192);
        assert_eq!(sender.segment(3).total, 3);
    }

    #[test]
    fn test_empty_payload() {
        let mut sender = sender(Vec::new(), 4096, Algorithm::Tahoe);
        assert_eq!(sender.total(), 0);
        assert!(sender.is_done());
        let batch = sender.send_window(1, 1, 64, Instant::now());
        assert!(batch.segments.is_empty());
        assert!(sender.check_timeout(1, 5, Instant::now()).unwrap().is_none());
    }

    #[test]
    fn test_send_window_bounds() {
        let mut sender = sender(pattern(100), 10, Algorithm::Tahoe);
        let now = Instant::now();
        let batch = sender.send_window(1, 1, 64, now);
        assert_eq!(batch.segments.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1]);
        assert_eq!(batch.next_seq, 2);

        // Nothing new until the window moves
        let batch = sender.send_window(2, 1, 64, now);
        assert!(batch.segments.is_empty());
        assert_eq!(batch.next_seq, 2);

        sender.on_ack(1, now);
        sender.on_ack(1, now);
        let batch = sender.send_window(2, 2, 64, now);
        assert_eq!(batch.segments.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(batch.next_seq, 4);
    }

    #[test]
    fn test_rwnd_limits_window() {
        let mut sender = sender(pattern(100), 10, Algorithm::Tahoe);
        let now = Instant::now();
        sender.send_window(1, 1, 64, now);
        sender.on_ack(1, now);
        sender.send_window(2, 2, 64, now);
        sender.on_ack(2, now);
        sender.on_ack(3, now);
        assert_eq!(sender.controller().cwnd(), 4.0);
        let batch = sender.send_window(4, 4, 2, now);
        assert_eq!(batch.segments.len(), 2);
    }

    #[test]
    fn test_loss_knob_withholds_but_records() {
        let mut sender = sender(pattern(100), 10, Algorithm::Tahoe).with_loss_rate(1.0);
        let now = Instant::now();
        let batch = sender.send_window(1, 1, 64, now);
        assert!(batch.segments.is_empty());
        assert_eq!(batch.dropped, 1);
        assert_eq!(batch.next_seq, 2);
        assert_eq!(sender.dropped_by_loss_knob(), 1);

        // The withheld segment still times out and is resent
        let later = now + Duration::from_millis(1_001);
        let resent = sender.check_timeout(1, 5, later).unwrap();
        assert_eq!(resent.map(|s| s.seq), Some(1));
    }

    #[test]
    fn test_karn_rule() {
        let mut sender = sender(pattern(30), 10, Algorithm::Tahoe);
        let t0 = Instant::now();
        sender.send_window(1, 1, 64, t0);

        // Timed out and resent: the ack is ambiguous
        let t1 = t0 + Duration::from_millis(1_500);
        assert!(sender.check_timeout(1, 5, t1).unwrap().is_some());
        let outcome = sender.on_ack(1, t1 + Duration::from_millis(40));
        assert_eq!(outcome.kind, AckKind::New);
        assert_eq!(outcome.rtt_sample_ms, None);

        let t2 = t1 + Duration::from_millis(50);
        sender.send_window(2, 2, 64, t2);
        let outcome = sender.on_ack(2, t2 + Duration::from_millis(80));
        assert_eq!(outcome.rtt_sample_ms, Some(80.0));

        // Same segment is sampled once only
        let outcome = sender.on_ack(2, t2 + Duration::from_millis(90));
        assert_eq!(outcome.kind, AckKind::Duplicate);
        assert_eq!(outcome.rtt_sample_ms, None);
    }

    #[test]
    fn test_no_sample_for_ack_over_resent_hole() {
        let mut sender = sender(pattern(40), 10, Algorithm::Tahoe);
        let t0 = Instant::now();
        sender.send_window(1, 1, 64, t0);
        assert_eq!(sender.on_ack(1, t0 + Duration::from_millis(10)).rtt_sample_ms, Some(10.0));

        // 2 is lost, 3 arrives and repeats ack 1
        let t1 = t0 + Duration::from_millis(10);
        let batch = sender.send_window(2, 2, 64, t1);
        assert_eq!(batch.segments.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(sender.on_ack(1, t1 + Duration::from_millis(10)).kind, AckKind::Duplicate);

        let t2 = t1 + Duration::from_millis(sender.controller().rto_ms() as u64 + 1);
        assert_eq!(sender.check_timeout(2, 5, t2).unwrap().map(|s| s.seq), Some(2));

        // 3 went out once, but its ack waited for the resent 2
        let outcome = sender.on_ack(3, t2 + Duration::from_millis(5));
        assert_eq!(outcome.kind, AckKind::New);
        assert_eq!(outcome.rtt_sample_ms, None);
        assert_eq!(sender.controller().srtt_ms(), Some(10.0));
    }

    #[test]
    fn test_timeout_not_before_rto() {
        let mut sender = sender(pattern(10), 10, Algorithm::Tahoe);
        let t0 = Instant::now();
        sender.send_window(1, 1, 64, t0);
        assert!(sender.check_timeout(1, 5, t0 + Duration::from_millis(1_000)).unwrap().is_none());
        assert!(sender.check_timeout(1, 5, t0 + Duration::from_millis(1_001)).unwrap().is_some());
        assert_eq!(sender.timeouts(), 1);
        assert_eq!(sender.controller().rto_ms(), 2_000.0);
    }

    #[test]
    fn test_retry_limit_exceeded() {
        let mut sender = sender(pattern(10), 10, Algorithm::Reno);
        let mut now = Instant::now();
        sender.send_window(1, 1, 64, now);

        for attempt in 1..=5 {
            now += Duration::from_millis(sender.controller().rto_ms() as u64 + 1);
            let resent = sender.check_timeout(1, 5, now).unwrap();
            assert_eq!(resent.map(|s| s.seq), Some(1), "attempt {attempt}");
        }
        now += Duration::from_millis(sender.controller().rto_ms() as u64 + 1);
        assert!(matches!(
            sender.check_timeout(1, 5, now),
            Err(TransferError::SegmentRetryExceeded { seq: 1, retries: 5 })
        ));
    }

    #[test]
    fn test_clean_run_cwnd_growth() {
        let data = pattern(100_000);
        let mut sender = sender(data.clone(), 4096, Algorithm::Tahoe);
        let mut receiver = Receiver::new(sender.total(), 64);
        assert_eq!(sender.total(), 25);

        let run = drive(&mut sender, &mut receiver, 64, &[]);
        assert_eq!(run.dup_acks, 0);
        assert_eq!(sender.fast_retransmits(), 0);
        assert_eq!(sender.timeouts(), 0);

        // Slow start adds one segment per ack up to ssthresh
        let expected: Vec<f64> = (2..=16).map(|v| v as f64).collect();
        assert_eq!(run.cwnd_trace[..15], expected[..]);
        for pair in run.cwnd_trace[15..].windows(2) {
            let step = pair[1] - pair[0];
            assert!(step > 0.0 && step <= 1.0 / 16.0 + 1e-9, "step {step}");
        }
        assert_eq!(sender.controller().phase(), Phase::CongestionAvoidance);
        assert!(run.acks.windows(2).all(|w| w[0] <= w[1]));

        assert!(receiver.is_complete());
        assert_eq!(receiver.finalize().unwrap(), data);
    }

    #[rstest]
    #[case::tahoe(Algorithm::Tahoe)]
    #[case::reno(Algorithm::Reno)]
    fn test_single_loss_recovered_by_fast_retransmit(#[case] algorithm: Algorithm) {
        let data = pattern(100);
        let mut sender = sender(data.clone(), 10, algorithm);
        let mut receiver = Receiver::new(sender.total(), 64);

        let run = drive(&mut sender, &mut receiver, 64, &[5]);
        assert_eq!(sender.fast_retransmits(), 1);
        assert_eq!(sender.timeouts(), 0);
        assert!(run.dup_acks >= 3);
        assert_eq!(run.fast_retransmits, vec![(5, 3)]);
        assert_eq!(run.acks.last(), Some(&10));
        assert!(run.acks.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(receiver.finalize().unwrap(), data);
    }

    #[rstest]
    #[case::tahoe(Algorithm::Tahoe)]
    #[case::reno(Algorithm::Reno)]
    fn test_single_loss_exact_duplicate_trace(#[case] algorithm: Algorithm) {
        let data = pattern(100);
        let mut sender = sender(data.clone(), 10, algorithm);
        let mut receiver = Receiver::new(sender.total(), 4);

        // rwnd 4 keeps exactly 6, 7 and 8 in flight behind the hole at 5
        let run = drive(&mut sender, &mut receiver, 4, &[5]);
        assert_eq!(run.acks, vec![1, 2, 3, 4, 4, 4, 4, 8, 9, 10]);
        assert_eq!(run.dup_acks, 3);
        assert_eq!(run.fast_retransmits, vec![(5, 3)]);
        assert_eq!(sender.fast_retransmits(), 1);
        assert_eq!(sender.timeouts(), 0);
        assert_eq!(receiver.finalize().unwrap(), data);
    }
}
