//! Binary entrypoint: load configuration, wire the Kafka source, the
//! Timescale sink, and the Prometheus metrics server around the core
//! engine, then run until a shutdown signal arrives.

use candle_ingest::{
    AdaptiveController, CircuitBreaker, CircuitBreakerConfig, Config, ConsumerLoop,
    DatabaseWriter, IngestMetrics, MessageProcessor, DEFAULT_RETRY_QUEUE_CAPACITY,
};
use candle_ingest_kafka::KafkaSource;
use candle_ingest_metrics::PrometheusMetrics;
use candle_ingest_timescale::TimescalePool;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "application_start");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration_error");
            return ExitCode::FAILURE;
        }
    };

    let metrics = match PrometheusMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::error!(error = %e, "metrics_registration_failed");
            return ExitCode::FAILURE;
        }
    };

    let metrics_server = metrics.clone();
    let metrics_port = config.metrics.port;
    tokio::spawn(async move {
        if let Err(e) = candle_ingest_metrics::serve(metrics_server, metrics_port).await {
            tracing::error!(error = %e, "metrics_server_failed");
        }
    });

    let source = match KafkaSource::new(
        &config.kafka.bootstrap_servers,
        &config.kafka.group_id,
        config.kafka.topic.clone(),
    ) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "kafka_source_init_failed");
            return ExitCode::FAILURE;
        }
    };

    let database_url = format!(
        "postgres://{user}:{password}@{host}:{port}/{dbname}",
        user = config.timescaledb.user,
        password = config.timescaledb.password,
        host = config.timescaledb.host,
        port = config.timescaledb.port,
        dbname = config.timescaledb.dbname,
    );
    let pool = match TimescalePool::connect(&database_url, config.timescaledb.pool_size).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, host = %config.timescaledb.host, database = %config.timescaledb.dbname, "database_connection_failed");
            return ExitCode::FAILURE;
        }
    };

    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        reset_timeout: config.circuit_breaker.reset_timeout,
        half_open_timeout: config.circuit_breaker.half_open_timeout,
    });

    let writer = DatabaseWriter::new(
        pool,
        breaker,
        DEFAULT_RETRY_QUEUE_CAPACITY,
        metrics.clone() as Arc<dyn IngestMetrics>,
        config.insert.retention_days,
    );

    let adaptive = AdaptiveController::new(
        config.dynamic_polling.clone(),
        config.kafka.initial_poll_timeout,
        config.kafka.initial_max_batch_size,
    );

    let processor = MessageProcessor::new(
        writer,
        adaptive,
        metrics.clone() as Arc<dyn IngestMetrics>,
        config.insert.time_interval,
        config.insert.retry_attempts,
        config.insert.retry_delay,
    );

    let mut consumer_loop = ConsumerLoop::new(source, processor, metrics as Arc<dyn IngestMetrics>);
    let running = consumer_loop.shutdown_handle();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown_signal_received");
        running.store(false, Ordering::SeqCst);
    });

    match consumer_loop.run().await {
        Ok(()) => {
            tracing::info!("graceful_shutdown_complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "consumer_loop_fatal_error");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` drives filtering as usual; `LOG_LEVEL` (the env var the
/// service this replaces used) is honored as a fallback default so an
/// unchanged deploy manifest still works.
fn init_logging() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
