// rdt/congestion.rs

#![forbid(unsafe_code)]

use tracing::{debug, trace};

use crate::rdt::common::{
    Algorithm, DUPLICATE_ACKS_BEFORE_RESEND, MAX_RTO_MS, MIN_CWND, MIN_RTO_MS, MIN_SSTHRESH, RTT_ALPHA,
    RTT_BETA,
};
use crate::rdt::config::TransferConfig;

/// Growth phase of the congestion window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::SlowStart => "slow_start",
            Phase::CongestionAvoidance => "congestion_avoidance",
            Phase::FastRecovery => "fast_recovery",
        }
    }
}

/// What the sender has to do after an ACK was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Retransmit(u32),
}

/// Smoothed RTT / RTT variance estimator (RFC 6298 gains)
#[derive(Debug, Clone, Default)]
struct RttEstimator {
    srtt_ms: Option<f64>,
    rttvar_ms: f64,
}

impl RttEstimator {
    fn update(&mut self, sample_ms: f64) {
        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(sample_ms);
                self.rttvar_ms = sample_ms / 2.0;
            }
            Some(srtt) => {
                // rttvar uses the previous srtt
                self.rttvar_ms = (1.0 - RTT_BETA) * self.rttvar_ms + RTT_BETA * (srtt - sample_ms).abs();
                self.srtt_ms = Some((1.0 - RTT_ALPHA) * srtt + RTT_ALPHA * sample_ms);
            }
        }
    }

    fn rto_ms(&self, max_rto_ms: f64) -> Option<f64> {
        self.srtt_ms
            .map(|srtt| (srtt + 4.0 * self.rttvar_ms).clamp(MIN_RTO_MS, max_rto_ms))
    }
}

/// Tahoe / Reno congestion controller for one session.
///
/// Windows are counted in segments, not bytes. `cwnd` is fractional so that
/// congestion avoidance can grow by `1/cwnd` per ACK.
#[derive(Debug, Clone)]
pub struct CongestionController {
    algorithm: Algorithm,
    cwnd: f64,
    ssthresh: f64,
    rtt: RttEstimator,
    rto_ms: f64,
    max_rto_ms: f64,
    phase: Phase,
    in_fast_recovery: bool,
    dup_acks: u32,
    last_ack: u32,
}

impl CongestionController {
    pub fn new(algorithm: Algorithm, initial_ssthresh: f64, initial_rto_ms: f64) -> Self {
        let ssthresh = initial_ssthresh.max(MIN_SSTHRESH);
        let mut cc = Self {
            algorithm,
            cwnd: MIN_CWND,
            ssthresh,
            rtt: RttEstimator::default(),
            rto_ms: initial_rto_ms.clamp(MIN_RTO_MS, MAX_RTO_MS),
            max_rto_ms: MAX_RTO_MS,
            phase: Phase::SlowStart,
            in_fast_recovery: false,
            dup_acks: 0,
            last_ack: 0,
        };
        cc.phase = cc.derive_phase();
        cc
    }

    /// Lowers the RTO ceiling; values outside the global bounds are clamped
    pub fn with_max_rto_ms(mut self, max_rto_ms: f64) -> Self {
        self.max_rto_ms = max_rto_ms.clamp(MIN_RTO_MS, MAX_RTO_MS);
        self.rto_ms = self.rto_ms.min(self.max_rto_ms);
        self
    }

    pub fn from_config(config: &TransferConfig, algorithm: Algorithm) -> Self {
        Self::new(algorithm, config.initial_ssthresh, config.initial_rto_ms).with_max_rto_ms(config.max_rto_ms)
    }

    /// Applies one cumulative ACK.
    ///
    /// `rtt_sample_ms` is fed to the estimator whenever present, duplicates
    /// included. Acks below `last_ack` are reordered stragglers and only
    /// contribute their RTT sample.
    pub fn on_ack(&mut self, ack_seq: u32, rtt_sample_ms: Option<f64>) -> Action {
        if let Some(sample) = rtt_sample_ms {
            self.rtt.update(sample);
            if let Some(rto) = self.rtt.rto_ms(self.max_rto_ms) {
                self.rto_ms = rto;
            }
        }

        if ack_seq > self.last_ack {
            if self.in_fast_recovery {
                // Window deflation
                self.in_fast_recovery = false;
                self.cwnd = self.ssthresh;
            } else if self.cwnd < self.ssthresh {
                self.cwnd += 1.0;
            } else {
                self.cwnd += 1.0 / self.cwnd;
            }
            self.last_ack = ack_seq;
            self.dup_acks = 0;
            self.update_phase();
            trace!(ack_seq, cwnd = self.cwnd, ssthresh = self.ssthresh, "new ack");
            return Action::None;
        }

        if ack_seq < self.last_ack {
            trace!(ack_seq, last_ack = self.last_ack, "stale ack ignored");
            return Action::None;
        }

        self.dup_acks += 1;
        if self.dup_acks == DUPLICATE_ACKS_BEFORE_RESEND {
            self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
            match self.algorithm {
                Algorithm::Tahoe => {
                    self.cwnd = MIN_CWND;
                    self.in_fast_recovery = false;
                }
                Algorithm::Reno => {
                    self.cwnd = self.ssthresh + 3.0;
                    self.in_fast_recovery = true;
                }
            }
            self.update_phase();
            debug!(
                algorithm = %self.algorithm,
                seq = self.last_ack + 1,
                cwnd = self.cwnd,
                ssthresh = self.ssthresh,
                "triple duplicate ack, fast retransmit"
            );
            return Action::Retransmit(self.last_ack + 1);
        }

        if self.dup_acks > DUPLICATE_ACKS_BEFORE_RESEND && self.in_fast_recovery {
            // Window inflation: each further duplicate means another segment left the network
            self.cwnd += 1.0;
            trace!(cwnd = self.cwnd, dup_acks = self.dup_acks, "fast recovery inflation");
        }
        Action::None
    }

    /// Reacts to a retransmission timeout
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = MIN_CWND;
        self.in_fast_recovery = false;
        self.dup_acks = 0;
        self.rto_ms = (self.rto_ms * 2.0).min(self.max_rto_ms);
        self.update_phase();
        debug!(ssthresh = self.ssthresh, rto_ms = self.rto_ms, "retransmission timeout");
    }

    fn derive_phase(&self) -> Phase {
        if self.in_fast_recovery {
            Phase::FastRecovery
        } else if self.cwnd < self.ssthresh {
            Phase::SlowStart
        } else {
            Phase::CongestionAvoidance
        }
    }

    fn update_phase(&mut self) {
        let next = self.derive_phase();
        if next != self.phase {
            debug!(
                from = self.phase.as_str(),
                to = next.as_str(),
                cwnd = self.cwnd,
                ssthresh = self.ssthresh,
                "congestion phase change"
            );
            self.phase = next;
        }
    }

    /// Segments that may be outstanding given the peer's advertised window
    pub fn window(&self, rwnd: u32) -> u32 {
        (self.cwnd.min(rwnd as f64).floor() as u32).max(1)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn rto_ms(&self) -> f64 {
        self.rto_ms
    }

    pub fn max_rto_ms(&self) -> f64 {
        self.max_rto_ms
    }

    pub fn srtt_ms(&self) -> Option<f64> {
        self.rtt.srtt_ms
    }

    pub fn rttvar_ms(&self) -> f64 {
        self.rtt.rttvar_ms
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }
}
