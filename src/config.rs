//! Environment-resolved configuration, built once at startup and handed by
//! reference to every component. Section shape and env var names follow
//! the ingestion service this crate replaces: one struct per concern
//! (`kafka`, `timescaledb`, `insert`, `metrics`, `dynamic_polling`,
//! `circuit_breaker`), validated eagerly so a bad deploy fails at startup
//! rather than mid-stream.

use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    pub initial_poll_timeout: Duration,
    pub initial_max_batch_size: usize,
    pub consumer_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TimescaleConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InsertConfig {
    pub batch_size: usize,
    pub time_interval: Duration,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub latency_threshold_high: f64,
    pub latency_threshold_low: f64,
    pub poll_timeout_min: Duration,
    pub poll_timeout_max: Duration,
    pub batch_size_min: usize,
    pub batch_size_max: usize,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub timescaledb: TimescaleConfig,
    pub insert: InsertConfig,
    pub metrics: MetricsConfig,
    pub dynamic_polling: AdaptiveConfig,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Config {
    /// Resolve configuration from the environment, falling back to the
    /// same defaults as the service this replaces. Validates ranges
    /// before returning so an invalid deploy fails fast at startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let kafka = KafkaConfig {
            bootstrap_servers: env_or(
                "KAFKA_BOOTSTRAP_SERVERS",
                "trading-cluster-kafka-bootstrap.kafka:9092",
            ),
            topic: env_or("KAFKA_TOPIC", "coinbase.candles"),
            group_id: env_or("KAFKA_GROUP_ID", "timescale_ingest_group"),
            initial_poll_timeout: parse_secs("KAFKA_INITIAL_POLL_TIMEOUT", 1.0)?,
            initial_max_batch_size: parse("KAFKA_INITIAL_MAX_BATCH_SIZE", 500)?,
            consumer_timeout: Duration::from_millis(parse("KAFKA_CONSUMER_TIMEOUT_MS", 5000)?),
        };

        let timescaledb = TimescaleConfig {
            host: env_or("TIMESCALEDB_HOST", "timescaledb.default.svc.cluster.local"),
            port: parse("TIMESCALEDB_PORT", 5432)?,
            dbname: env_or("TIMESCALEDB_DBNAME", "market_data"),
            user: env_or("TIMESCALEDB_USER", "timescale_user"),
            password: env_or("TIMESCALEDB_PASSWORD", "timescale_password"),
            pool_size: parse("TIMESCALEDB_POOL_SIZE", 10)?,
            connection_timeout: Duration::from_secs(parse("TIMESCALEDB_CONNECTION_TIMEOUT", 10)?),
        };

        let insert = InsertConfig {
            batch_size: parse("INSERT_BATCH_SIZE", 500)?,
            time_interval: parse_secs("INSERT_TIME_INTERVAL", 5.0)?,
            retry_attempts: parse("INSERT_RETRY_ATTEMPTS", 3)?,
            retry_delay: parse_secs("INSERT_RETRY_DELAY", 1.0)?,
            retention_days: parse("INSERT_RETENTION_DAYS", 90)?,
        };

        let metrics = MetricsConfig { port: parse("METRICS_PORT", 8000)? };

        let dynamic_polling = AdaptiveConfig {
            latency_threshold_high: parse("LATENCY_THRESHOLD_HIGH", 1.0)?,
            latency_threshold_low: parse("LATENCY_THRESHOLD_LOW", 0.2)?,
            poll_timeout_min: parse_secs("POLL_TIMEOUT_MIN", 0.5)?,
            poll_timeout_max: parse_secs("POLL_TIMEOUT_MAX", 5.0)?,
            batch_size_min: parse("BATCH_SIZE_MIN", 100)?,
            batch_size_max: parse("BATCH_SIZE_MAX", 2000)?,
        };

        let circuit_breaker = CircuitBreakerSettings {
            failure_threshold: parse("CB_FAILURE_THRESHOLD", 5)?,
            reset_timeout: parse_secs("CB_RESET_TIMEOUT", 60.0)?,
            half_open_timeout: parse_secs("CB_HALF_OPEN_TIMEOUT", 30.0)?,
        };

        let config = Self { kafka, timescaledb, insert, metrics, dynamic_polling, circuit_breaker };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.initial_poll_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "KAFKA_INITIAL_POLL_TIMEOUT",
                value: "0".into(),
                reason: "must be positive",
            });
        }
        if !(1..=100).contains(&self.timescaledb.pool_size) {
            return Err(ConfigError::Invalid {
                key: "TIMESCALEDB_POOL_SIZE",
                value: self.timescaledb.pool_size.to_string(),
                reason: "must be between 1 and 100",
            });
        }
        if self.insert.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "INSERT_BATCH_SIZE",
                value: "0".into(),
                reason: "must be positive",
            });
        }
        Ok(())
    }
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw.clone(), reason: "not a valid number" }),
    }
}

fn parse_secs(key: &'static str, default_secs: f64) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, default_secs)?;
    if secs < 0.0 || !secs.is_finite() {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: "must be a finite, non-negative number of seconds",
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
