use hourwise_domain::{AggregateStore, AggregateUpdateService, ReadingIngestService};
use hourwise_nats::{create_reading_processor, NatsClient, NatsConsumer};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A long-running worker process: takes a cancellation token, runs until
/// cancelled or failed.
pub type WorkerProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub struct AggregationWorkerConfig {
    pub readings_stream: String,
    pub readings_subject: String,
    pub consumer_name: String,
    pub nats_batch_size: usize,
    pub nats_batch_wait_secs: u64,
    pub update_max_attempts: u32,
    pub update_retry_backoff_ms: u64,
}

/// Wires the aggregation service stack to a JetStream consumer.
///
/// The store is injected; the worker owns no state of its own beyond the
/// consumer it runs.
pub struct AggregationWorker {
    consumer: NatsConsumer,
}

impl AggregationWorker {
    pub async fn new(
        store: Arc<dyn AggregateStore>,
        nats_client: Arc<NatsClient>,
        config: AggregationWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!("Initializing aggregation worker");

        let update_service = Arc::new(AggregateUpdateService::with_policy(
            store,
            config.update_max_attempts,
            Duration::from_millis(config.update_retry_backoff_ms),
        ));
        let ingest_service = Arc::new(ReadingIngestService::new(update_service));

        let processor = create_reading_processor(ingest_service);
        let consumer = NatsConsumer::new(
            nats_client.jetstream(),
            &config.readings_stream,
            &config.consumer_name,
            &config.readings_subject,
            config.nats_batch_size,
            config.nats_batch_wait_secs,
            processor,
        )
        .await?;

        info!("Aggregation worker initialized");

        Ok(Self { consumer })
    }

    pub fn into_runner_process(self) -> WorkerProcess {
        Box::new({
            let consumer = self.consumer;
            move |ctx| Box::pin(async move { consumer.run(ctx).await })
        })
    }
}
