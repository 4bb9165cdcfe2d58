//! Adaptive polling: widen the poll timeout and shrink the batch size when
//! inserts are slow, narrow and grow them back when inserts are fast.
//! Single owner, no shared state — the processor holds the only instance.

pub use crate::config::AdaptiveConfig;
use std::time::Duration;

/// `current_poll_timeout`/`current_max_batch_size`, each clamped to the
/// configured min/max.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    poll_timeout: Duration,
    max_batch_size: usize,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, initial_poll_timeout: Duration, initial_max_batch_size: usize) -> Self {
        Self {
            poll_timeout: clamp_duration(initial_poll_timeout, config.poll_timeout_min, config.poll_timeout_max),
            max_batch_size: initial_max_batch_size.clamp(config.batch_size_min, config.batch_size_max),
            config,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Adjust both knobs based on the latency of the flush that just
    /// completed. Above the high threshold: poll less often (x1.5, capped)
    /// and shrink batches (x0.8, floored). Below the low threshold: poll
    /// more often (x0.8, floored) and grow batches (x1.2, capped). Between
    /// the thresholds: no change.
    pub fn adapt(&mut self, insert_latency: Duration) {
        let latency_secs = insert_latency.as_secs_f64();

        if latency_secs > self.config.latency_threshold_high {
            self.poll_timeout = clamp_duration(
                self.poll_timeout.mul_f64(1.5),
                self.config.poll_timeout_min,
                self.config.poll_timeout_max,
            );
            self.max_batch_size =
                ((self.max_batch_size as f64 * 0.8) as usize).max(self.config.batch_size_min);
        } else if latency_secs < self.config.latency_threshold_low {
            self.poll_timeout = clamp_duration(
                self.poll_timeout.mul_f64(0.8),
                self.config.poll_timeout_min,
                self.config.poll_timeout_max,
            );
            self.max_batch_size =
                ((self.max_batch_size as f64 * 1.2) as usize).min(self.config.batch_size_max);
        }
    }
}

fn clamp_duration(value: Duration, min: Duration, max: Duration) -> Duration {
    value.clamp(min, max)
}
