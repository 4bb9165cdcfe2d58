//! Kafka `Source` adapter over `rdkafka::consumer::StreamConsumer`.
//! Auto-commit, at-least-once — the engine never asks for manual offset
//! control.

use async_trait::async_trait;
use candle_ingest::{Offset, Partition, Source, SourceError, SourceRecord};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use std::collections::HashMap;
use std::time::Duration;

pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl std::fmt::Debug for KafkaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSource").field("topic", &self.topic).finish()
    }
}

impl KafkaSource {
    /// Build a consumer from bootstrap servers and a group id. Mirrors the
    /// original service's `AIOKafkaConsumer` construction: auto-commit,
    /// `earliest` offset reset, generous session/request timeouts.
    pub fn new(bootstrap_servers: &str, group_id: &str, topic: impl Into<String>) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("retry.backoff.ms", "500")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        Ok(Self { consumer, topic: topic.into() })
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        self.consumer.subscribe(&[&self.topic]).map_err(|e| SourceError::Connect(e.to_string()))?;
        tracing::info!(topic = %self.topic, "kafka_consumer_started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    /// Drains whatever arrives within `timeout`, grouped by partition.
    /// `StreamConsumer` has no native "get many" call, so this polls
    /// `recv()` against a shrinking deadline, matching aiokafka's
    /// `getmany(timeout_ms)` semantics from the caller's point of view.
    async fn get_many(&mut self, timeout: Duration) -> Result<HashMap<Partition, Vec<SourceRecord>>, SourceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batches: HashMap<Partition, Vec<SourceRecord>> = HashMap::new();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let partition = message.partition();
                    let offset = message.offset();
                    let payload = message.payload().unwrap_or_default().to_vec();
                    batches.entry(partition).or_default().push(SourceRecord { partition, offset, payload });
                }
                Ok(Err(e)) => return Err(SourceError::Poll(e.to_string())),
                Err(_elapsed) => break,
            }
        }

        Ok(batches)
    }

    fn position(&self, partition: Partition) -> Option<Offset> {
        let positions = self.consumer.position().ok()?;
        positions
            .elements()
            .iter()
            .find(|tp| tp.topic() == self.topic && tp.partition() == partition)
            .and_then(|tp| tp.offset().to_raw())
    }

    async fn end_offsets(&self, partitions: &[Partition]) -> Result<HashMap<Partition, Offset>, SourceError> {
        let mut offsets = HashMap::new();
        for &partition in partitions {
            let (_low, high) = self
                .consumer
                .fetch_watermarks(&self.topic, partition, Duration::from_secs(5))
                .map_err(watermark_error)?;
            offsets.insert(partition, high);
        }
        Ok(offsets)
    }
}

fn watermark_error(e: KafkaError) -> SourceError {
    SourceError::Poll(e.to_string())
}
