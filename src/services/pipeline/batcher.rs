//! Batcher
//!
//! Accumulates records until `send_batch_size` or `timeout`, whichever comes
//! first, and hard-caps any outgoing batch at `send_batch_max_size`
//! (over-sized inputs are split, never truncated).

use crate::config::BatchConfig;
use crate::models::Record;
use std::time::{Duration, Instant};

pub struct Batcher {
    send_batch_size: usize,
    send_batch_max_size: usize,
    timeout: Duration,
    pending: Vec<Record>,
    oldest_pending: Option<Instant>,
}

impl Batcher {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            send_batch_size: config.send_batch_size,
            send_batch_max_size: config.send_batch_max_size.max(config.send_batch_size),
            timeout: Duration::from_millis(config.timeout_ms),
            pending: Vec::new(),
            oldest_pending: None,
        }
    }

    /// Add records; returns every full batch that became ready
    pub fn push(&mut self, records: Vec<Record>) -> Vec<Vec<Record>> {
        if records.is_empty() {
            return Vec::new();
        }
        if self.pending.is_empty() {
            self.oldest_pending = Some(Instant::now());
        }
        self.pending.extend(records);

        let mut ready = Vec::new();
        while self.pending.len() >= self.send_batch_size {
            let take = self.pending.len().min(self.send_batch_max_size);
            let batch: Vec<Record> = self.pending.drain(..take).collect();
            ready.push(batch);
        }
        if self.pending.is_empty() {
            self.oldest_pending = None;
        }
        ready
    }

    /// Flush on timeout expiry; None when nothing is due
    pub fn flush_if_due(&mut self) -> Option<Vec<Record>> {
        let due = self
            .oldest_pending
            .map(|at| at.elapsed() >= self.timeout)
            .unwrap_or(false);
        if due { self.flush() } else { None }
    }

    /// Unconditional flush of whatever is pending
    pub fn flush(&mut self) -> Option<Vec<Record>> {
        if self.pending.is_empty() {
            return None;
        }
        self.oldest_pending = None;
        let take = self.pending.len().min(self.send_batch_max_size);
        Some(self.pending.drain(..take).collect())
    }

    /// Drop the oldest pending records; used by the memory limiter's
    /// critical band. Returns how many records were shed.
    pub fn shed_oldest(&mut self) -> usize {
        let shed = self.pending.len().min(self.send_batch_size.max(1));
        self.pending.drain(..shed);
        if self.pending.is_empty() {
            self.oldest_pending = None;
        }
        shed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// How long until the pending timeout fires, for the runtime's timer
    pub fn next_deadline(&self) -> Option<Duration> {
        self.oldest_pending.map(|at| self.timeout.saturating_sub(at.elapsed()))
    }
}
