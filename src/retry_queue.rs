//! Bounded FIFO queue for candles that could not be written while the
//! circuit breaker was open.

use crate::model::CandleRecord;
use std::collections::VecDeque;

/// Default `Q_max`: capacity of a `RetryQueue` when nothing more specific
/// is configured.
pub const DEFAULT_RETRY_QUEUE_CAPACITY: usize = 10_000;

/// Bounded `VecDeque` with a drop-arrivals overflow policy: once full, new
/// records are dropped (and counted) rather than evicting anything already
/// queued.
#[derive(Debug)]
pub struct RetryQueue {
    records: VecDeque<CandleRecord>,
    capacity: usize,
    dropped: u64,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self { records: VecDeque::with_capacity(capacity.min(1024)), capacity, dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Enqueue as many of `records` as fit under capacity; the rest are
    /// dropped and counted.
    pub fn enqueue(&mut self, records: Vec<CandleRecord>) {
        let room = self.capacity.saturating_sub(self.records.len());
        let to_drop = records.len().saturating_sub(room);
        for record in records.into_iter().take(room) {
            self.records.push_back(record);
        }
        if to_drop > 0 {
            self.dropped += to_drop as u64;
            tracing::error!(dropped = to_drop, queue_size = self.records.len(), "retry_queue_full");
        } else {
            tracing::info!(queue_size = self.records.len(), "queued_records_for_retry");
        }
    }

    /// Drain everything currently queued, in FIFO order.
    pub fn drain_all(&mut self) -> Vec<CandleRecord> {
        self.records.drain(..).collect()
    }
}
