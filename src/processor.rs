//! `MessageProcessor`: validates incoming payloads into the buffer, decides
//! when to flush, and drives the retry-with-backoff loop around a flush
//! that comes back from the writer as a hard failure (as opposed to the
//! writer's own circuit-open handling, which never reaches here).

use crate::adaptive::AdaptiveController;
use crate::metrics::IngestMetrics;
use crate::model::{self, CandleRecord, ValidationError};
use crate::sink::{Pool, WriteError};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::writer::DatabaseWriter;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum ProcessOutcome {
    Buffered { symbol: String },
    Invalid(ValidationError),
}

pub struct MessageProcessor<P: Pool> {
    writer: DatabaseWriter<P>,
    adaptive: AdaptiveController,
    metrics: Arc<dyn IngestMetrics>,
    sleeper: Arc<dyn Sleeper>,
    buffer: Vec<CandleRecord>,
    last_flush: Instant,
    time_interval: Duration,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl<P: Pool> MessageProcessor<P> {
    pub fn new(
        writer: DatabaseWriter<P>,
        adaptive: AdaptiveController,
        metrics: Arc<dyn IngestMetrics>,
        time_interval: Duration,
        retry_attempts: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            writer,
            adaptive,
            metrics,
            sleeper: Arc::new(TokioSleeper),
            buffer: Vec::new(),
            last_flush: Instant::now(),
            time_interval,
            retry_attempts,
            retry_delay,
        }
    }

    #[cfg(test)]
    fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn poll_timeout(&self) -> Duration {
        self.adaptive.poll_timeout()
    }

    pub fn max_batch_size(&self) -> usize {
        self.adaptive.max_batch_size()
    }

    /// Decode, validate, and buffer one message. Counts are emitted here;
    /// the caller decides whether to act on `ProcessOutcome::Invalid` beyond
    /// that (there's nothing further to do — the record is simply dropped).
    pub fn process_message(&mut self, raw_value: &[u8]) -> ProcessOutcome {
        match model::parse_message(raw_value) {
            Ok(record) => {
                self.metrics.message_consumed(&record.symbol);
                let symbol = record.symbol.clone();
                self.buffer.push(record);
                self.metrics.set_current_batch_size(self.buffer.len());
                self.metrics.observe_batch_size(self.buffer.len());
                ProcessOutcome::Buffered { symbol }
            }
            Err(e) => {
                self.metrics.invalid_message(invalid_reason(&e));
                if let ValidationError::NegativeOrNonFinite { field, .. } = &e {
                    self.metrics.data_validation_error(field, "negative_or_non_finite");
                }
                ProcessOutcome::Invalid(e)
            }
        }
    }

    pub fn should_flush(&self) -> bool {
        self.buffer.len() >= self.adaptive.max_batch_size()
            || self.last_flush.elapsed() >= self.time_interval
    }

    /// Flush the buffer. Groups by symbol (stable, insertion order
    /// preserved) and writes each group sequentially — each
    /// `writer.insert_batch` call is its own atomic unit, so one bad
    /// symbol group cannot roll back groups that already landed.
    ///
    /// Implements the buffer-retention behavior: the buffer is retained
    /// across the retry loop and cleared exactly once, after the loop
    /// concludes either way.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let buffer_len = self.buffer.len();
        let mut grouped = group_by_symbol(&self.buffer);
        let start = Instant::now();

        let result = self.send_groups_with_retry(&mut grouped).await;

        if result.is_ok() {
            let elapsed = start.elapsed();
            self.metrics.observe_db_insert_latency(elapsed.as_secs_f64());
            let elapsed_secs = elapsed.as_secs_f64();
            if elapsed_secs > 0.0 {
                self.metrics.observe_message_processing_rate(buffer_len as f64 / elapsed_secs);
            }
            self.adaptive.adapt(elapsed);
            self.metrics.set_current_poll_timeout(self.adaptive.poll_timeout().as_secs_f64());
            self.metrics.set_current_max_batch_size(self.adaptive.max_batch_size());
        }

        self.buffer.clear();
        self.metrics.set_current_batch_size(0);
        self.last_flush = Instant::now();
        result
    }

    /// Retry the per-group send with `retry_delay * 2^k` backoff, up to
    /// `retry_attempts` times, logging a fatal event once exhausted. Groups
    /// that already succeeded on an earlier attempt are not retried.
    async fn send_groups_with_retry(
        &mut self,
        grouped: &mut IndexMap<String, Vec<CandleRecord>>,
    ) -> Result<(), WriteError> {
        let mut attempt = 0;
        loop {
            match self.send_pending_groups(grouped).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry_attempts => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        remaining_groups = grouped.len(),
                        "flush retry attempt failed"
                    );
                    let delay = self.retry_delay.mul_f64(2f64.powi(attempt as i32));
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        remaining_groups = grouped.len(),
                        "all retry attempts failed, dropping remaining groups"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Write each remaining symbol group sequentially, removing it from
    /// `grouped` as it succeeds. Stops at the first failing group, leaving
    /// the rest in `grouped` for the next retry attempt.
    async fn send_pending_groups(
        &mut self,
        grouped: &mut IndexMap<String, Vec<CandleRecord>>,
    ) -> Result<(), WriteError> {
        let symbols: Vec<String> = grouped.keys().cloned().collect();
        for symbol in symbols {
            let records = match grouped.get(&symbol) {
                Some(r) => r.clone(),
                None => continue,
            };
            let count = records.len();
            self.writer.insert_batch(records).await?;
            self.metrics.message_inserted(&symbol, count as u64);
            grouped.shift_remove(&symbol);
        }
        Ok(())
    }
}

fn group_by_symbol(records: &[CandleRecord]) -> IndexMap<String, Vec<CandleRecord>> {
    let mut grouped: IndexMap<String, Vec<CandleRecord>> = IndexMap::new();
    for record in records {
        grouped.entry(record.symbol.clone()).or_default().push(record.clone());
    }
    grouped
}

fn invalid_reason(e: &ValidationError) -> &'static str {
    match e {
        ValidationError::Decode(_) => "json_decode_error",
        ValidationError::InvalidTimestamp { .. } => "validation_error",
        ValidationError::NegativeOrNonFinite { .. } => "validation_error",
        ValidationError::InvalidSymbol { .. } => "validation_error",
    }
}


#[cfg(test)]
impl<P: Pool> MessageProcessor<P> {
    fn writer_retry_queue_len_for_test(&self) -> usize {
        self.writer.retry_queue_len()
    }
}
