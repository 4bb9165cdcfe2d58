#![forbid(unsafe_code)]

//! Core engine for the candle ingestion pipeline: validation, circuit
//! breaking, the bounded retry queue, and the database writer that ties
//! them together in front of a pluggable sink.
//!
//! Adapters live in sibling crates (`candle-ingest-kafka`,
//! `candle-ingest-timescale`, `candle-ingest-metrics`); this crate depends
//! only on the `Source`, `Pool`/`Connection`, and `IngestMetrics` trait
//! seams so the hot path stays testable without a broker or a database.

mod adaptive;
mod backoff;
mod circuit_breaker;
mod clock;
mod config;
mod metrics;
mod model;
mod retry;
mod retry_queue;
mod sink;
mod sleeper;
mod source;
mod writer;

pub use adaptive::{AdaptiveConfig, AdaptiveController};
pub use backoff::Backoff;
pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use config::{Config, ConfigError};
pub use metrics::{IngestMetrics, NoopMetrics};
pub use model::{parse_message, CandleRecord, RawCandleMessage, RawTimestamp, ValidationError};
pub use retry::{BuildError, RetryError, RetryPolicy, RetryPolicyBuilder};
pub use retry_queue::{RetryQueue, DEFAULT_RETRY_QUEUE_CAPACITY};
pub use sink::{BatchStats, Connection, DbStats, Pool, WriteError, WriterStats};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use source::{Offset, Partition, Source, SourceError, SourceRecord};
pub use writer::DatabaseWriter;

mod processor;
pub use processor::{MessageProcessor, ProcessOutcome};

mod consumer_loop;
pub use consumer_loop::ConsumerLoop;
