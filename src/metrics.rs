//! Metrics seam: a narrow trait the core emits events through, so unit
//! tests don't need a real Prometheus registry. `candle-ingest-metrics`
//! implements this over `prometheus::{Counter,Gauge,Histogram}Vec`s; the
//! idiom (register once, update at call sites through a thin sink) follows
//! the teacher's `TelemetrySink` pattern for policy events.

/// All methods default to no-ops so a fake only needs to override what it
/// asserts on.
pub trait IngestMetrics: Send + Sync {
    fn message_consumed(&self, _symbol: &str) {}
    fn message_inserted(&self, _symbol: &str, _count: u64) {}
    fn invalid_message(&self, _reason: &str) {}
    fn db_insert_error(&self, _error_type: &str) {}
    fn db_connection_error(&self) {}
    fn set_db_pool_size(&self, _size: u32) {}
    fn set_db_pool_waiting(&self, _waiting: u32) {}
    fn observe_db_insert_latency(&self, _seconds: f64) {}
    fn observe_kafka_consume_latency(&self, _seconds: f64) {}
    fn set_current_batch_size(&self, _size: usize) {}
    fn observe_batch_size(&self, _size: usize) {}
    fn set_circuit_breaker_state(&self, _state: u8) {}
    fn circuit_breaker_trip(&self) {}
    fn set_kafka_consumer_lag(&self, _partition: i32, _lag: i64) {}
    fn set_kafka_partition_offset(&self, _partition: i32, _offset: i64) {}
    fn set_current_poll_timeout(&self, _seconds: f64) {}
    fn set_current_max_batch_size(&self, _size: usize) {}
    fn observe_message_processing_rate(&self, _records_per_sec: f64) {}
    fn set_db_records_total(&self, _symbol: &str, _count: i64) {}
    fn set_db_oldest_record(&self, _unix_seconds: f64) {}
    fn set_db_newest_record(&self, _unix_seconds: f64) {}
    fn set_db_retry_queue_size(&self, _size: usize) {}
    fn batch_processed(&self, _status: &str) {}
    fn data_validation_error(&self, _field: &str, _error_type: &str) {}
}

/// No-op implementation for tests and for running with metrics disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl IngestMetrics for NoopMetrics {}
