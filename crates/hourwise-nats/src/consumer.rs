use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind, Message};
use futures::{future::BoxFuture, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-message dispositions for one processed batch.
///
/// Indices refer to positions in the fetched batch. `ack` confirms a
/// committed reading; `term` drops a reading that can never succeed
/// (no redelivery); `nak` requests redelivery for readings whose
/// contribution did not commit this time.
#[derive(Debug, Default)]
pub struct ProcessingResult {
    pub ack: Vec<usize>,
    pub term: Vec<(usize, String)>,
    pub nak: Vec<(usize, Option<String>)>,
}

impl ProcessingResult {
    /// Reject the whole batch for redelivery.
    pub fn nak_all(count: usize, error: Option<String>) -> Self {
        Self {
            ack: Vec::new(),
            term: Vec::new(),
            nak: (0..count).map(|i| (i, error.clone())).collect(),
        }
    }
}

/// Batch processor function: receives the raw fetched messages, returns
/// the disposition for each. Deserialization and business logic live in
/// the processor, not the consumer.
pub type BatchProcessor =
    Box<dyn Fn(&[Message]) -> BoxFuture<'static, Result<ProcessingResult>> + Send + Sync>;

/// Durable JetStream pull consumer feeding fetched batches through a
/// [`BatchProcessor`] and applying the resulting dispositions.
pub struct NatsConsumer {
    consumer: PullConsumer,
    batch_size: usize,
    max_wait: Duration,
    processor: BatchProcessor,
}

impl NatsConsumer {
    pub async fn new(
        jetstream: &jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
        subject_filter: &str,
        batch_size: usize,
        max_wait_secs: u64,
        processor: BatchProcessor,
    ) -> Result<Self> {
        debug!(
            stream = stream_name,
            consumer = consumer_name,
            subject = subject_filter,
            "Creating JetStream consumer"
        );

        let consumer = jetstream
            .create_consumer_on_stream(
                jetstream::consumer::pull::Config {
                    name: Some(consumer_name.to_string()),
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: subject_filter.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
                stream_name,
            )
            .await
            .context("Failed to create consumer")?;

        info!(
            stream = stream_name,
            consumer = consumer_name,
            "Consumer created successfully"
        );

        Ok(Self {
            consumer,
            batch_size,
            max_wait: Duration::from_secs(max_wait_secs),
            processor,
        })
    }

    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        info!("Starting consumer loop");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("Received shutdown signal, stopping consumer");
                    break;
                }
                result = self.fetch_and_process_batch() => {
                    if let Err(e) = result {
                        error!(error = %e, "Error processing batch");
                        // Keep consuming; the fetch cycle is retried.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        info!("Consumer stopped gracefully");
        Ok(())
    }

    async fn fetch_and_process_batch(&self) -> Result<()> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(self.batch_size)
            .expires(self.max_wait)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut batch = Vec::new();
        while let Some(result) = messages.next().await {
            match result {
                Ok(msg) => batch.push(msg),
                Err(e) => {
                    warn!(error = %e, "Error receiving message from batch");
                }
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        debug!(message_count = batch.len(), "Received message batch");

        let result = match (self.processor)(&batch).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Processor returned error, rejecting all messages");
                ProcessingResult::nak_all(batch.len(), Some(e.to_string()))
            }
        };

        self.apply_dispositions(&batch, result).await;
        Ok(())
    }

    async fn apply_dispositions(&self, batch: &[Message], result: ProcessingResult) {
        for idx in result.ack {
            match batch.get(idx) {
                Some(msg) => {
                    if let Err(e) = msg.ack().await {
                        error!(error = %e, message_index = idx, "Failed to acknowledge message");
                    }
                }
                None => warn!(message_index = idx, "Invalid ack index in ProcessingResult"),
            }
        }

        for (idx, reason) in result.term {
            match batch.get(idx) {
                Some(msg) => {
                    warn!(
                        message_index = idx,
                        subject = %msg.subject,
                        reason = %reason,
                        "Terminating message, it will not be redelivered"
                    );
                    if let Err(e) = msg.ack_with(AckKind::Term).await {
                        error!(error = %e, message_index = idx, "Failed to terminate message");
                    }
                }
                None => warn!(message_index = idx, "Invalid term index in ProcessingResult"),
            }
        }

        for (idx, reason) in result.nak {
            match batch.get(idx) {
                Some(msg) => {
                    warn!(
                        message_index = idx,
                        subject = %msg.subject,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "Rejecting message for redelivery"
                    );
                    if let Err(e) = msg.ack_with(AckKind::Nak(None)).await {
                        error!(error = %e, message_index = idx, "Failed to reject message");
                    }
                }
                None => warn!(message_index = idx, "Invalid nak index in ProcessingResult"),
            }
        }
    }
}
