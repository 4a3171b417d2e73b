mod config;
mod telemetry;

use aggregation_worker::{AggregationWorker, AggregationWorkerConfig, WorkerProcess};
use config::ServiceConfig;
use hourwise_nats::NatsClient;
use hourwise_postgres::{PostgresAggregateStore, PostgresClient, PostgresConfig};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        readings_stream = %config.readings_stream,
        consumer = %config.consumer_name,
        "Starting hourwise worker"
    );

    let exit_code = match run(&config).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Worker exiting with error: {:#}", e);
            1
        }
    };

    shutdown_telemetry(telemetry_providers);
    std::process::exit(exit_code);
}

async fn run(config: &ServiceConfig) -> anyhow::Result<()> {
    // Store client and schema, constructed once and injected downward.
    info!("Initializing PostgreSQL...");
    let postgres_client = PostgresClient::new(&PostgresConfig {
        host: config.postgres_host.clone(),
        port: config.postgres_port,
        database: config.postgres_database.clone(),
        username: config.postgres_username.clone(),
        password: config.postgres_password.clone(),
        max_pool_size: config.postgres_max_pool_size,
    })?;
    postgres_client.ping().await?;
    let store = Arc::new(PostgresAggregateStore::new(postgres_client));
    store.ensure_schema().await?;

    info!("Initializing NATS...");
    let nats_client = Arc::new(
        NatsClient::connect(
            &config.nats_url,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?,
    );
    nats_client.ensure_stream(&config.readings_stream).await?;

    let worker = AggregationWorker::new(
        store,
        nats_client,
        AggregationWorkerConfig {
            readings_stream: config.readings_stream.clone(),
            readings_subject: config.readings_subject.clone(),
            consumer_name: config.consumer_name.clone(),
            nats_batch_size: config.nats_batch_size,
            nats_batch_wait_secs: config.nats_batch_wait_secs,
            update_max_attempts: config.update_max_attempts,
            update_retry_backoff_ms: config.update_retry_backoff_ms,
        },
    )
    .await?;

    supervise(worker.into_runner_process()).await
}

/// Run the worker process until it finishes or a shutdown signal arrives,
/// then cancel and drain.
async fn supervise(process: WorkerProcess) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let mut join_set = JoinSet::new();

    {
        let process_token = token.clone();
        join_set.spawn(async move { process(process_token).await });
    }

    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(err) => {
                error!("Error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_token = token.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM signal");
                    sigterm_token.cancel();
                }
                Err(err) => {
                    error!("Error setting up SIGTERM handler: {}", err);
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                token.cancel();
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("worker task panicked: {err}"));
                }
                token.cancel();
            }
        }
    }
    join_set.shutdown().await;

    match first_error {
        Some(err) => Err(err),
        None => {
            info!("Worker stopped cleanly");
            Ok(())
        }
    }
}
