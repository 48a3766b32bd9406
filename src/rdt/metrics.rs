// rdt/metrics.rs

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Mutex;

#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::rdt::common::{Algorithm, SessionKey, unix_millis};
use crate::rdt::congestion::CongestionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricEvent {
    Ack,
    DupAck,
    /// Reordered ack below the cumulative point
    StaleAck,
    FastRetransmit,
    Timeout,
}

/// One sender-side observation, written as a JSON line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub ts_ms: u64,
    pub room: String,
    pub filename: String,
    pub peer: String,
    pub seq: u32,
    pub bytes: usize,
    pub rtt_sample_ms: Option<f64>,
    pub srtt_ms: Option<f64>,
    pub rto_ms: f64,
    pub cwnd: f64,
    pub ssthresh: f64,
    pub event: MetricEvent,
    pub algorithm: Algorithm,
}

impl MetricsRecord {
    /// Snapshots the controller right after `event` was applied
    pub fn snapshot(
        key: &SessionKey,
        event: MetricEvent,
        seq: u32,
        bytes: usize,
        rtt_sample_ms: Option<f64>,
        cc: &CongestionController,
    ) -> Self {
        Self {
            ts_ms: unix_millis(),
            room: key.room.to_string(),
            filename: key.filename.clone(),
            peer: key.peer.to_string(),
            seq,
            bytes,
            rtt_sample_ms,
            srtt_ms: cc.srtt_ms(),
            rto_ms: cc.rto_ms(),
            cwnd: cc.cwnd(),
            ssthresh: cc.ssthresh(),
            event,
            algorithm: cc.algorithm(),
        }
    }
}

/// Write-only destination for metrics. Implementations must not block.
#[cfg_attr(test, automock)]
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, record: MetricsRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record(&self, _record: MetricsRecord) {}
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    records: Mutex<Vec<MetricsRecord>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, event: MetricEvent) -> usize {
        self.records().iter().filter(|r| r.event == event).count()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record(&self, record: MetricsRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Appends JSON lines to a file from a background task.
///
/// The task drains and flushes once every `JsonlMetrics` handle is dropped;
/// await the returned `JoinHandle` to be sure the file is complete.
#[derive(Debug, Clone)]
pub struct JsonlMetrics {
    tx: mpsc::UnboundedSender<MetricsRecord>,
}

impl JsonlMetrics {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<(Self, JoinHandle<()>)> {
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path.as_ref()).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<MetricsRecord>();

        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Unable to serialize metrics record: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = out.write_all(&line).await {
                    warn!("Metrics writer stopped: {}", e);
                    return;
                }
                if rx.is_empty() {
                    if let Err(e) = out.flush().await {
                        warn!("Metrics flush failed: {}", e);
                    }
                }
            }
            if let Err(e) = out.flush().await {
                warn!("Metrics flush failed: {}", e);
            }
        });
        Ok((Self { tx }, writer))
    }
}

impl MetricsSink for JsonlMetrics {
    fn record(&self, record: MetricsRecord) {
        // Receiver gone means the writer hit an I/O error and already logged it
        let _ = self.tx.send(record);
    }
}
