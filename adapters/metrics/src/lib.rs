//! Prometheus-backed `IngestMetrics` implementation plus the `/metrics` and
//! `/health` HTTP routes the ops side scrapes and probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use candle_ingest::IngestMetrics;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0];
const KAFKA_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5];
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0];

/// Registers every `timescale_ingest_*` metric once at construction and
/// updates them from the `IngestMetrics` call sites. One registry per
/// process; there is no global default registry here so tests can build
/// throwaway instances.
pub struct PrometheusMetrics {
    registry: Registry,
    messages_consumed: IntCounterVec,
    messages_inserted: IntCounterVec,
    invalid_messages: IntCounterVec,
    db_insert_errors: IntCounterVec,
    db_connection_errors: IntCounter,
    db_connection_pool_size: IntGauge,
    db_pool_waiting_clients: IntGauge,
    db_insert_latency: Histogram,
    kafka_consume_latency: Histogram,
    current_batch_size: IntGauge,
    batch_size_histogram: Histogram,
    circuit_breaker_state: IntGauge,
    circuit_breaker_trips: IntCounter,
    kafka_consumer_lag: IntGaugeVec,
    kafka_partition_offset: IntGaugeVec,
    current_poll_timeout: Gauge,
    current_max_batch_size: IntGauge,
    message_processing_rate: Gauge,
    db_records_total: IntGaugeVec,
    db_oldest_record: Gauge,
    db_newest_record: Gauge,
    db_retry_queue_size: IntGauge,
    batch_processing_total: IntCounterVec,
    data_validation_errors: IntCounterVec,
}

macro_rules! register {
    ($registry:expr, $metric:expr) => {{
        $registry.register(Box::new($metric.clone()))?;
        $metric
    }};
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_consumed = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_messages_consumed_total", "Total number of messages consumed"), &["symbol"])?
        );
        let messages_inserted = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_messages_inserted_total", "Total number of messages inserted"), &["symbol"])?
        );
        let invalid_messages = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_invalid_messages_total", "Total number of invalid messages"), &["reason"])?
        );
        let db_insert_errors = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_db_insert_errors_total", "Total number of DB insert errors"), &["error_type"])?
        );
        let db_connection_errors = register!(
            registry,
            IntCounter::with_opts(Opts::new("timescale_ingest_db_connection_errors_total", "Total number of database connection errors"))?
        );
        let db_connection_pool_size =
            register!(registry, IntGauge::with_opts(Opts::new("timescale_ingest_db_connection_pool_size", "Current database connection pool size"))?);
        let db_pool_waiting_clients = register!(
            registry,
            IntGauge::with_opts(Opts::new("timescale_ingest_db_pool_waiting_clients", "Number of clients waiting for a database connection"))?
        );
        let db_insert_latency = register!(
            registry,
            Histogram::with_opts(
                HistogramOpts::new("timescale_ingest_db_insert_latency_seconds", "DB insertion batch latency").buckets(LATENCY_BUCKETS.to_vec())
            )?
        );
        let kafka_consume_latency = register!(
            registry,
            Histogram::with_opts(
                HistogramOpts::new("timescale_ingest_kafka_consume_latency_seconds", "Kafka message consumption latency")
                    .buckets(KAFKA_LATENCY_BUCKETS.to_vec())
            )?
        );
        let current_batch_size = register!(registry, IntGauge::with_opts(Opts::new("timescale_ingest_current_batch_size", "Current batch size"))?);
        let batch_size_histogram = register!(
            registry,
            Histogram::with_opts(HistogramOpts::new("timescale_ingest_batch_size", "Distribution of batch sizes").buckets(BATCH_SIZE_BUCKETS.to_vec()))?
        );
        let circuit_breaker_state = register!(
            registry,
            IntGauge::with_opts(Opts::new("timescale_ingest_circuit_breaker_state", "Circuit breaker state (0=closed, 1=half-open, 2=open)"))?
        );
        let circuit_breaker_trips =
            register!(registry, IntCounter::with_opts(Opts::new("timescale_ingest_circuit_breaker_trips_total", "Number of times circuit breaker has tripped"))?);
        let kafka_consumer_lag = register!(
            registry,
            IntGaugeVec::new(Opts::new("timescale_ingest_kafka_consumer_lag", "Number of messages the consumer is behind"), &["partition"])?
        );
        let kafka_partition_offset = register!(
            registry,
            IntGaugeVec::new(Opts::new("timescale_ingest_kafka_partition_offset", "Current offset for each partition"), &["partition"])?
        );
        let current_poll_timeout =
            register!(registry, Gauge::with_opts(Opts::new("timescale_ingest_current_poll_timeout_seconds", "Current Kafka poll timeout setting"))?);
        let current_max_batch_size =
            register!(registry, IntGauge::with_opts(Opts::new("timescale_ingest_current_max_batch_size", "Current maximum batch size setting"))?);
        let message_processing_rate =
            register!(registry, Gauge::with_opts(Opts::new("timescale_ingest_message_processing_rate", "Rate of message processing per second"))?);
        let db_records_total =
            register!(registry, IntGaugeVec::new(Opts::new("timescale_ingest_db_records_total", "Total number of records in the database"), &["symbol"])?);
        let db_oldest_record =
            register!(registry, Gauge::with_opts(Opts::new("timescale_ingest_db_oldest_record_timestamp", "Timestamp of oldest record in database"))?);
        let db_newest_record =
            register!(registry, Gauge::with_opts(Opts::new("timescale_ingest_db_newest_record_timestamp", "Timestamp of newest record in database"))?);
        let db_retry_queue_size =
            register!(registry, IntGauge::with_opts(Opts::new("timescale_ingest_db_retry_queue_size", "Number of records waiting in retry queue"))?);
        let batch_processing_total = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_batch_processing_total", "Total number of batches processed"), &["status"])?
        );
        let data_validation_errors = register!(
            registry,
            IntCounterVec::new(Opts::new("timescale_ingest_data_validation_errors_total", "Total number of data validation errors"), &["field", "error_type"])?
        );

        Ok(Self {
            registry,
            messages_consumed,
            messages_inserted,
            invalid_messages,
            db_insert_errors,
            db_connection_errors,
            db_connection_pool_size,
            db_pool_waiting_clients,
            db_insert_latency,
            kafka_consume_latency,
            current_batch_size,
            batch_size_histogram,
            circuit_breaker_state,
            circuit_breaker_trips,
            kafka_consumer_lag,
            kafka_partition_offset,
            current_poll_timeout,
            current_max_batch_size,
            message_processing_rate,
            db_records_total,
            db_oldest_record,
            db_newest_record,
            db_retry_queue_size,
            batch_processing_total,
            data_validation_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl IngestMetrics for PrometheusMetrics {
    fn message_consumed(&self, symbol: &str) {
        self.messages_consumed.with_label_values(&[symbol]).inc();
    }

    fn message_inserted(&self, symbol: &str, count: u64) {
        self.messages_inserted.with_label_values(&[symbol]).inc_by(count);
    }

    fn invalid_message(&self, reason: &str) {
        self.invalid_messages.with_label_values(&[reason]).inc();
    }

    fn db_insert_error(&self, error_type: &str) {
        self.db_insert_errors.with_label_values(&[error_type]).inc();
    }

    fn db_connection_error(&self) {
        self.db_connection_errors.inc();
    }

    fn set_db_pool_size(&self, size: u32) {
        self.db_connection_pool_size.set(size as i64);
    }

    fn set_db_pool_waiting(&self, waiting: u32) {
        self.db_pool_waiting_clients.set(waiting as i64);
    }

    fn observe_db_insert_latency(&self, seconds: f64) {
        self.db_insert_latency.observe(seconds);
    }

    fn observe_kafka_consume_latency(&self, seconds: f64) {
        self.kafka_consume_latency.observe(seconds);
    }

    fn set_current_batch_size(&self, size: usize) {
        self.current_batch_size.set(size as i64);
    }

    fn observe_batch_size(&self, size: usize) {
        self.batch_size_histogram.observe(size as f64);
    }

    fn set_circuit_breaker_state(&self, state: u8) {
        self.circuit_breaker_state.set(state as i64);
    }

    fn circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.inc();
    }

    fn set_kafka_consumer_lag(&self, partition: i32, lag: i64) {
        self.kafka_consumer_lag.with_label_values(&[&partition.to_string()]).set(lag);
    }

    fn set_kafka_partition_offset(&self, partition: i32, offset: i64) {
        self.kafka_partition_offset.with_label_values(&[&partition.to_string()]).set(offset);
    }

    fn set_current_poll_timeout(&self, seconds: f64) {
        self.current_poll_timeout.set(seconds);
    }

    fn set_current_max_batch_size(&self, size: usize) {
        self.current_max_batch_size.set(size as i64);
    }

    fn observe_message_processing_rate(&self, records_per_sec: f64) {
        self.message_processing_rate.set(records_per_sec);
    }

    fn set_db_records_total(&self, symbol: &str, count: i64) {
        self.db_records_total.with_label_values(&[symbol]).set(count);
    }

    fn set_db_oldest_record(&self, unix_seconds: f64) {
        self.db_oldest_record.set(unix_seconds);
    }

    fn set_db_newest_record(&self, unix_seconds: f64) {
        self.db_newest_record.set(unix_seconds);
    }

    fn set_db_retry_queue_size(&self, size: usize) {
        self.db_retry_queue_size.set(size as i64);
    }

    fn batch_processed(&self, status: &str) {
        self.batch_processing_total.with_label_values(&[status]).inc();
    }

    fn data_validation_error(&self, field: &str, error_type: &str) {
        self.data_validation_errors.with_label_values(&[field, error_type]).inc();
    }
}

async fn health_check() -> impl IntoResponse {
    tracing::debug!("health_check_called");
    (StatusCode::OK, "healthy")
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics.registry().gather();
    let mut buf = Vec::new();
    match encoder.encode(&families, &mut buf) {
        Ok(()) => (StatusCode::OK, [("Content-Type", encoder.format_type())], buf).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics_generation_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Builds the `/health` + `/metrics` router. Health never probes the sink —
/// it only answers whether this process is alive, matching the k8s liveness
/// contract the original service exposed.
pub fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new().route("/health", get(health_check)).route("/metrics", get(metrics_handler)).with_state(metrics)
}

/// Binds `0.0.0.0:{port}` and serves the metrics/health routes until the
/// process exits.
pub async fn serve(metrics: Arc<PrometheusMetrics>, port: u16) -> std::io::Result<()> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "metrics_server_started");
    axum::serve(listener, app).await
}
