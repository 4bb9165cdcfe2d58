//! Source trait seam: the consumer loop depends only on `Source`, never on
//! a concrete Kafka client. `candle-ingest-kafka` is the production
//! implementation over `rdkafka::consumer::StreamConsumer`; tests use an
//! in-memory double.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Topic partition number. Topic itself is fixed per `Source` instance.
pub type Partition = i32;

/// Kafka-style partition offset.
pub type Offset = i64;

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub partition: Partition,
    pub offset: Offset,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum SourceError {
    Connect(String),
    Poll(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "source connect failed: {msg}"),
            Self::Poll(msg) => write!(f, "source poll failed: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Minimal consumer surface the core drives. Auto-commit, at-least-once;
/// the core never asks for manual offset control.
#[async_trait]
pub trait Source: Send {
    async fn start(&mut self) -> Result<(), SourceError>;

    async fn stop(&mut self) -> Result<(), SourceError>;

    /// Poll all assigned partitions for up to `timeout`, grouped by
    /// partition in arrival order. An empty map means nothing arrived
    /// within the timeout, not an error.
    async fn get_many(&mut self, timeout: Duration) -> Result<HashMap<Partition, Vec<SourceRecord>>, SourceError>;

    /// Current consumer position for a partition, for consumer-lag metrics.
    fn position(&self, partition: Partition) -> Option<Offset>;

    /// High-water mark per partition, for consumer-lag metrics.
    async fn end_offsets(&self, partitions: &[Partition]) -> Result<HashMap<Partition, Offset>, SourceError>;
}
