//! `ConsumerLoop`: pulls from the source, hands records to the processor in
//! offset order, and drives a bounded graceful shutdown.

use crate::metrics::IngestMetrics;
use crate::processor::MessageProcessor;
use crate::sink::Pool;
use crate::source::Source;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ConsumerLoop<S: Source, P: Pool> {
    source: S,
    processor: MessageProcessor<P>,
    metrics: Arc<dyn IngestMetrics>,
    running: Arc<AtomicBool>,
    shutdown_grace: Duration,
}

impl<S: Source, P: Pool> ConsumerLoop<S, P> {
    pub fn new(source: S, processor: MessageProcessor<P>, metrics: Arc<dyn IngestMetrics>) -> Self {
        Self { source, processor, metrics, running: Arc::new(AtomicBool::new(false)), shutdown_grace: Duration::from_secs(30) }
    }

    /// A handle the caller can flip from a signal handler task to request
    /// shutdown. The loop itself is the only other reader/writer.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub async fn run(&mut self) -> Result<(), crate::source::SourceError> {
        self.source.start().await?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("consumer_loop_started");

        while self.running.load(Ordering::SeqCst) {
            let poll_timeout = self.processor.poll_timeout();
            let batches = self.source.get_many(poll_timeout).await?;

            for (partition, records) in batches {
                let end_offset = self
                    .source
                    .end_offsets(&[partition])
                    .await
                    .ok()
                    .and_then(|m| m.get(&partition).copied());
                let current_position = self.source.position(partition);

                for record in records {
                    let _ = self.processor.process_message(&record.payload);

                    if let (Some(end), Some(position)) = (end_offset, current_position) {
                        let lag = (end - position).max(0);
                        self.metrics.set_kafka_consumer_lag(partition, lag);
                    }
                    self.metrics.set_kafka_partition_offset(partition, record.offset);
                }
            }

            if self.processor.should_flush() {
                if let Err(e) = self.processor.flush().await {
                    tracing::error!(error = %e, "scheduled_flush_failed");
                }
            }
        }

        tracing::info!("consumer_loop_stopping, draining in-flight flush");
        let _ = tokio::time::timeout(self.shutdown_grace, self.processor.flush()).await;
        self.source.stop().await?;
        tracing::info!("consumer_loop_stopped");
        Ok(())
    }
}
