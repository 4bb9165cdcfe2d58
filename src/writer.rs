//! `DatabaseWriter`: circuit-breaker-guarded upsert into the sink, with a
//! bounded retry queue for records that arrive while the breaker is open.

use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::metrics::IngestMetrics;
use crate::model::CandleRecord;
use crate::retry::{RetryError, RetryPolicy};
use crate::retry_queue::RetryQueue;
use crate::sink::{BatchStats, Connection, Pool, WriteError, WriterStats};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct DatabaseWriter<P: Pool> {
    pool: P,
    breaker: CircuitBreaker,
    retry_queue: RetryQueue,
    deadlock_retry: RetryPolicy<WriteError>,
    metrics: Arc<dyn IngestMetrics>,
    retention_days: i64,
    batch_stats: BatchStats,
}

impl<P: Pool> DatabaseWriter<P> {
    pub fn new(
        pool: P,
        breaker: CircuitBreaker,
        retry_queue_capacity: usize,
        metrics: Arc<dyn IngestMetrics>,
        retention_days: i64,
    ) -> Self {
        let deadlock_retry = RetryPolicy::builder()
            .max_attempts(3)
            .expect("3 > 0")
            .backoff(crate::Backoff::exponential(Duration::from_millis(100)))
            .should_retry(|e: &WriteError| matches!(e, WriteError::Deadlock))
            .build();

        Self {
            pool,
            breaker,
            retry_queue: RetryQueue::new(retry_queue_capacity),
            deadlock_retry,
            metrics,
            retention_days,
            batch_stats: BatchStats::default(),
        }
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// Insert the whole flushed buffer in one connection, one transaction.
    /// Records queued from a prior open-circuit window are prepended and
    /// cleared before the new ones, exactly once.
    pub async fn insert_batch(&mut self, records: Vec<CandleRecord>) -> Result<(), WriteError> {
        if records.is_empty() {
            return Ok(());
        }

        tracing::info!(batch_size = records.len(), table = "candles", "inserting_batch");

        let mut combined = self.retry_queue.drain_all();
        combined.extend(records);

        let combined_len = combined.len();
        let pool = &self.pool;
        let deadlock_retry = &self.deadlock_retry;
        let metrics = &self.metrics;
        let rows = &combined;

        let start = Instant::now();
        let result = self
            .breaker
            .execute(|| async move { write_once(pool, deadlock_retry, metrics.as_ref(), rows).await })
            .await;
        metrics.observe_db_insert_latency(start.elapsed().as_secs_f64());
        metrics.set_circuit_breaker_state(breaker_state_code(self.breaker.state()));

        match result {
            Ok(()) => {
                self.batch_stats.total_processed += combined_len as u64;
                self.metrics.batch_processed("success");
                Ok(())
            }
            Err(BreakerError::CircuitOpen { .. }) => {
                self.metrics.circuit_breaker_trip();
                let dropped_before = self.retry_queue.dropped();
                self.retry_queue.enqueue(combined);
                let dropped_delta = self.retry_queue.dropped() - dropped_before;
                self.batch_stats.total_retried += combined_len as u64 - dropped_delta;
                self.batch_stats.total_dropped += dropped_delta;
                if dropped_delta > 0 {
                    self.metrics.batch_processed("dropped");
                } else {
                    self.metrics.batch_processed("retry");
                }
                self.metrics.set_db_retry_queue_size(self.retry_queue.len());
                Ok(())
            }
            Err(BreakerError::Failure(e)) => {
                tracing::error!(error = %e, batch_size = combined_len, "batch_insert_failed");
                Err(e)
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.pool.acquire().await {
            Ok(mut conn) => conn.health_check().await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn cleanup(&self) -> Result<(), WriteError> {
        let mut conn = self.pool.acquire().await?;
        conn.cleanup(self.retention_days).await
    }

    pub async fn get_stats(&self) -> Result<WriterStats, WriteError> {
        let mut conn = self.pool.acquire().await?;
        let db_stats = conn.stats().await?;
        if let Some(oldest) = db_stats.oldest_record {
            self.metrics.set_db_oldest_record(oldest.timestamp() as f64);
        }
        if let Some(newest) = db_stats.newest_record {
            self.metrics.set_db_newest_record(newest.timestamp() as f64);
        }
        self.metrics.set_db_retry_queue_size(self.retry_queue.len());
        Ok(WriterStats {
            db_stats,
            batch_stats: self.batch_stats.clone(),
            retry_queue_size: self.retry_queue.len(),
        })
    }

    pub async fn vacuum_analyze(&self) -> Result<(), WriteError> {
        let mut conn = self.pool.acquire().await?;
        conn.vacuum_analyze().await
    }
}

fn breaker_state_code(state: crate::circuit_breaker::CircuitState) -> u8 {
    use crate::circuit_breaker::CircuitState::*;
    match state {
        Closed => 0,
        HalfOpen => 1,
        Open => 2,
    }
}

async fn write_once<P: Pool>(
    pool: &P,
    deadlock_retry: &RetryPolicy<WriteError>,
    metrics: &dyn IngestMetrics,
    rows: &[CandleRecord],
) -> Result<(), WriteError> {
    let result = deadlock_retry
        .execute(|| async {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|_| WriteError::Connectivity("pool acquire failed".into()))?;
            conn.upsert_candles(rows).await
        })
        .await;

    match result {
        Ok(()) => Ok(()),
        Err(RetryError::Inner(WriteError::UniqueViolation)) => {
            tracing::warn!("duplicate record detected, skipping");
            metrics.db_insert_error("unique_violation");
            Ok(())
        }
        Err(RetryError::Inner(other)) => {
            metrics.db_insert_error(error_type_label(&other));
            Err(other)
        }
        Err(RetryError::Exhausted { failures, .. }) => {
            metrics.db_insert_error("deadlock_exhausted");
            Err(failures.into_iter().next_back().unwrap_or(WriteError::Deadlock))
        }
    }
}

fn error_type_label(e: &WriteError) -> &'static str {
    match e {
        WriteError::Deadlock => "deadlock",
        WriteError::UniqueViolation => "unique_violation",
        WriteError::Connectivity(_) => "connectivity",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::model::test_support::sample_record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeConn {
        upserted: Arc<Mutex<Vec<CandleRecord>>>,
        fail_with: Option<WriteError>,
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn upsert_candles(&mut self, rows: &[CandleRecord]) -> Result<(), WriteError> {
            if let Some(e) = &self.fail_with {
                return Err(match e {
                    WriteError::Deadlock => WriteError::Deadlock,
                    WriteError::UniqueViolation => WriteError::UniqueViolation,
                    WriteError::Connectivity(s) => WriteError::Connectivity(s.clone()),
                });
            }
            self.upserted.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }

        async fn health_check(&mut self) -> Result<(), WriteError> {
            Ok(())
        }

        async fn cleanup(&mut self, _retention_days: i64) -> Result<(), WriteError> {
            Ok(())
        }

        async fn stats(&mut self) -> Result<DbStats, WriteError> {
            Ok(DbStats::default())
        }

        async fn vacuum_analyze(&mut self) -> Result<(), WriteError> {
            Ok(())
        }
    }

    struct FakePool {
        upserted: Arc<Mutex<Vec<CandleRecord>>>,
        fail_with: Option<WriteError>,
        healthy: Arc<std::sync::atomic::AtomicBool>,
        acquire_calls: AtomicUsize,
    }

    impl FakePool {
        fn always_failing(e: WriteError) -> Self {
            Self {
                upserted: Arc::new(Mutex::new(Vec::new())),
                fail_with: Some(e),
                healthy: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                acquire_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Pool for FakePool {
        type Conn = FakeConn;

        async fn acquire(&self) -> Result<Self::Conn, WriteError> {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            let fail_with = if self.healthy.load(Ordering::SeqCst) {
                None
            } else {
                match &self.fail_with {
                    Some(WriteError::Deadlock) => Some(WriteError::Deadlock),
                    Some(WriteError::UniqueViolation) => Some(WriteError::UniqueViolation),
                    Some(WriteError::Connectivity(s)) => Some(WriteError::Connectivity(s.clone())),
                    None => None,
                }
            };
            Ok(FakeConn { upserted: self.upserted.clone(), fail_with })
        }

        fn size(&self) -> u32 {
            1
        }

        fn max_size(&self) -> u32 {
            1
        }
    }

    #[derive(Debug, Clone)]
    struct ManualClock(Arc<std::sync::atomic::AtomicU64>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(std::sync::atomic::AtomicU64::new(0)))
        }

        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl crate::clock::Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(crate::circuit_breaker::CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn successful_insert_clears_and_writes() {
        let upserted = Arc::new(Mutex::new(Vec::new()));
        let pool = FakePool {
            upserted: upserted.clone(),
            fail_with: None,
            healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            acquire_calls: AtomicUsize::new(0),
        };
        let mut writer = DatabaseWriter::new(pool, breaker(3), 100, Arc::new(NoopMetrics), 90);

        writer.insert_batch(vec![sample_record("AAA")]).await.unwrap();
        assert_eq!(upserted.lock().unwrap().len(), 1);
        assert_eq!(writer.retry_queue_len(), 0);
    }

    #[tokio::test]
    async fn unique_violation_is_swallowed() {
        let pool = FakePool::always_failing(WriteError::UniqueViolation);
        let mut writer = DatabaseWriter::new(pool, breaker(3), 100, Arc::new(NoopMetrics), 90);

        let result = writer.insert_batch(vec![sample_record("AAA")]).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn open_circuit_enqueues_for_retry_instead_of_erroring() {
        let pool = FakePool::always_failing(WriteError::Connectivity("down".into()));
        let mut writer = DatabaseWriter::new(pool, breaker(1), 100, Arc::new(NoopMetrics), 90);

        // The call that actually trips the breaker invokes the op and gets a
        // real failure (`BreakerError::Failure`), which the writer surfaces
        // rather than queues — only a short-circuited `CircuitOpen` is queued.
        let result = writer.insert_batch(vec![sample_record("AAA")]).await;
        assert!(result.is_err(), "the tripping failure itself surfaces, it is not queued");
        assert_eq!(writer.retry_queue_len(), 0);

        let result = writer.insert_batch(vec![sample_record("BBB")]).await;
        assert!(result.is_ok(), "circuit now open, new batch queued rather than failing");
        assert_eq!(writer.retry_queue_len(), 1, "only the batch submitted while open is queued");
    }

    #[tokio::test]
    async fn retry_queue_is_prepended_and_cleared_on_next_success() {
        let upserted = Arc::new(Mutex::new(Vec::new()));
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pool = FakePool {
            upserted: upserted.clone(),
            fail_with: Some(WriteError::Connectivity("down".into())),
            healthy: healthy.clone(),
            acquire_calls: AtomicUsize::new(0),
        };
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(
            crate::circuit_breaker::CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(100),
                half_open_timeout: Duration::from_secs(30),
            },
            Box::new(clock.clone()),
        );
        let mut writer = DatabaseWriter::new(pool, breaker, 100, Arc::new(NoopMetrics), 90);

        // First call trips the breaker; it invoked the op and failed, so the
        // record surfaces as an error rather than being queued.
        let result = writer.insert_batch(vec![sample_record("AAA")]).await;
        assert!(result.is_err(), "tripping failure surfaces, is not queued");
        assert_eq!(writer.retry_queue_len(), 0);
        assert!(upserted.lock().unwrap().is_empty());

        // Second call arrives while the circuit is still open within the
        // reset window: short-circuited, so this one does get queued.
        writer.insert_batch(vec![sample_record("BBB")]).await.unwrap();
        assert_eq!(writer.retry_queue_len(), 1, "queued while circuit remains open");

        clock.advance(150);
        healthy.store(true, Ordering::SeqCst);

        writer.insert_batch(vec![sample_record("CCC")]).await.unwrap();

        let written = upserted.lock().unwrap();
        assert_eq!(written.len(), 2, "queued record and new record both land in the same flush");
        assert_eq!(written[0].symbol, "BBB", "queued record is prepended ahead of the new one");
        assert_eq!(written[1].symbol, "CCC");
        drop(written);
        assert_eq!(writer.retry_queue_len(), 0, "queue is cleared once the flush succeeds");
    }

    #[tokio::test]
    async fn bounded_queue_drops_arrivals_past_capacity() {
        let pool = FakePool::always_failing(WriteError::Connectivity("down".into()));
        let mut writer = DatabaseWriter::new(pool, breaker(1), 1, Arc::new(NoopMetrics), 90);

        let first = writer.insert_batch(vec![sample_record("AAA")]).await;
        assert!(first.is_err(), "tripping failure surfaces, leaving the queue empty");

        writer.insert_batch(vec![sample_record("BBB"), sample_record("CCC")]).await.unwrap();

        assert_eq!(writer.retry_queue_len(), 1, "capacity 1, only the first of the two records is admitted");
    }

    /// A connection whose `upsert_candles` fails with `Deadlock` for its
    /// first `fail_times` calls, then succeeds — models transient lock
    /// contention resolving within the query-level retry budget.
    struct FlakyDeadlockConn {
        upserted: Arc<Mutex<Vec<CandleRecord>>>,
        remaining_failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for FlakyDeadlockConn {
        async fn upsert_candles(&mut self, rows: &[CandleRecord]) -> Result<(), WriteError> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(WriteError::Deadlock);
            }
            self.upserted.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
        async fn health_check(&mut self) -> Result<(), WriteError> {
            Ok(())
        }
        async fn cleanup(&mut self, _retention_days: i64) -> Result<(), WriteError> {
            Ok(())
        }
        async fn stats(&mut self) -> Result<DbStats, WriteError> {
            Ok(DbStats::default())
        }
        async fn vacuum_analyze(&mut self) -> Result<(), WriteError> {
            Ok(())
        }
    }

    struct FlakyDeadlockPool {
        upserted: Arc<Mutex<Vec<CandleRecord>>>,
        remaining_failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Pool for FlakyDeadlockPool {
        type Conn = FlakyDeadlockConn;
        async fn acquire(&self) -> Result<Self::Conn, WriteError> {
            Ok(FlakyDeadlockConn {
                upserted: self.upserted.clone(),
                remaining_failures: self.remaining_failures.clone(),
            })
        }
        fn size(&self) -> u32 {
            1
        }
        fn max_size(&self) -> u32 {
            1
        }
    }

    #[tokio::test]
    async fn deadlock_retries_within_budget_then_succeeds() {
        let upserted = Arc::new(Mutex::new(Vec::new()));
        let pool = FlakyDeadlockPool { upserted: upserted.clone(), remaining_failures: Arc::new(AtomicUsize::new(2)) };
        let mut writer = DatabaseWriter::new(pool, breaker(5), 100, Arc::new(NoopMetrics), 90);

        writer.insert_batch(vec![sample_record("AAA")]).await.unwrap();

        assert_eq!(upserted.lock().unwrap().len(), 1, "third attempt (within the 3-attempt budget) succeeds");
    }

    #[tokio::test]
    async fn get_stats_reports_batch_counters_and_retry_queue_size() {
        let pool = FakePool::always_failing(WriteError::Connectivity("down".into()));
        let mut writer = DatabaseWriter::new(pool, breaker(1), 100, Arc::new(NoopMetrics), 90);

        // Trips the breaker (surfaces as failure, nothing queued).
        writer.insert_batch(vec![sample_record("AAA")]).await.unwrap_err();
        // Short-circuited while open: queued for retry.
        writer.insert_batch(vec![sample_record("BBB"), sample_record("CCC")]).await.unwrap();

        let stats = writer.get_stats().await.unwrap();
        assert_eq!(stats.batch_stats.total_processed, 0);
        assert_eq!(stats.batch_stats.total_retried, 2);
        assert_eq!(stats.batch_stats.total_dropped, 0);
        assert_eq!(stats.retry_queue_size, 2);
        assert_eq!(stats.db_stats, DbStats::default());
    }

    #[tokio::test]
    async fn get_stats_counts_dropped_records_past_queue_capacity() {
        let pool = FakePool::always_failing(WriteError::Connectivity("down".into()));
        let mut writer = DatabaseWriter::new(pool, breaker(1), 1, Arc::new(NoopMetrics), 90);

        writer.insert_batch(vec![sample_record("AAA")]).await.unwrap_err();
        writer.insert_batch(vec![sample_record("BBB"), sample_record("CCC")]).await.unwrap();

        let stats = writer.get_stats().await.unwrap();
        assert_eq!(stats.batch_stats.total_retried, 1, "only one of the two records fit");
        assert_eq!(stats.batch_stats.total_dropped, 1);
        assert_eq!(stats.retry_queue_size, 1);
    }

    #[tokio::test]
    async fn get_stats_counts_processed_records_on_success() {
        let pool = FakePool {
            upserted: Arc::new(Mutex::new(Vec::new())),
            fail_with: None,
            healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            acquire_calls: AtomicUsize::new(0),
        };
        let mut writer = DatabaseWriter::new(pool, breaker(3), 100, Arc::new(NoopMetrics), 90);

        writer.insert_batch(vec![sample_record("AAA"), sample_record("BBB")]).await.unwrap();
        writer.insert_batch(vec![sample_record("CCC")]).await.unwrap();

        let stats = writer.get_stats().await.unwrap();
        assert_eq!(stats.batch_stats.total_processed, 3);
        assert_eq!(stats.batch_stats.total_retried, 0);
        assert_eq!(stats.batch_stats.total_dropped, 0);
    }

    #[tokio::test]
    async fn deadlock_exhausts_retry_budget_and_surfaces_as_failure() {
        let upserted = Arc::new(Mutex::new(Vec::new()));
        let pool = FlakyDeadlockPool { upserted: upserted.clone(), remaining_failures: Arc::new(AtomicUsize::new(10)) };
        let mut writer = DatabaseWriter::new(pool, breaker(5), 100, Arc::new(NoopMetrics), 90);

        let result = writer.insert_batch(vec![sample_record("AAA")]).await;

        assert!(result.is_err(), "3 deadlock attempts all exhausted, failure surfaces rather than being queued");
        assert!(upserted.lock().unwrap().is_empty());
    }
}
