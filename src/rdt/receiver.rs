// rdt/receiver.rs

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::trace;

use crate::rdt::common::TransferError;

/// Receiving half of a transfer: buffers segments until the stream is whole.
#[derive(Debug)]
pub struct Receiver {
    total: u32,
    rwnd: u32,
    buffer: BTreeMap<u32, Bytes>,
    next_expected: u32,
    duplicates: u64,
}

impl Receiver {
    pub fn new(total: u32, rwnd: u32) -> Self {
        Self { total, rwnd, buffer: BTreeMap::new(), next_expected: 1, duplicates: 0 }
    }

    /// Stores a segment and returns the cumulative ack (`next_expected - 1`).
    ///
    /// Out-of-range seqs and duplicates leave the state untouched but still
    /// produce an ack, so the sender sees the duplicate.
    pub fn add_chunk(&mut self, seq: u32, data: Bytes) -> u32 {
        if seq == 0 || seq > self.total {
            trace!(seq, total = self.total, "segment out of range");
            return self.ack();
        }
        if seq < self.next_expected || self.buffer.contains_key(&seq) {
            self.duplicates += 1;
            return self.ack();
        }
        self.buffer.insert(seq, data);
        while self.buffer.contains_key(&self.next_expected) {
            self.next_expected += 1;
        }
        self.ack()
    }

    pub fn ack(&self) -> u32 {
        self.next_expected - 1
    }

    pub fn rwnd(&self) -> u32 {
        self.rwnd
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn received(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total
    }

    /// Concatenates the buffered segments in order.
    pub fn finalize(self) -> Result<Vec<u8>, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::IncompleteTransfer { received: self.received(), total: self.total });
        }
        let len = self.buffer.values().map(Bytes::len).sum();
        let mut out = Vec::with_capacity(len);
        for chunk in self.buffer.into_values() {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
