//! Anvil Worker binary
//!
//! Wires the HTTP repositories, the container engine and the pipeline engine
//! together, then consumes the queue until interrupted.

use anvil_client::ControllerClient;
use anvil_worker::config::Config;
use anvil_worker::engine::{EngineConfig, PipelineEngine};
use anvil_worker::repository::{
    ArtifactStore, HttpArtifactStore, HttpExecutionRepository, HttpLogRepository,
    HttpMessageQueue, HttpStatusSink, LocalArtifactStore,
};
use anvil_worker::runtime::CliRuntime;
use anvil_worker::scheduler::{ConsumerConfig, QueueConsumer};
use anvil_worker::service::{GitFetcher, RetryPolicy, StatusReporter};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anvil_worker=info,anvil_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Anvil Worker");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, controller_url={}, engine={}",
        config.worker_id,
        config.controller_url,
        config.container_engine.binary()
    );

    let runtime = CliRuntime::new(config.container_engine);
    runtime
        .check_available()
        .await
        .context("Container engine check failed")?;

    let client = ControllerClient::new(config.controller_url.clone());

    let artifacts: Arc<dyn ArtifactStore> = match &config.artifact_dir {
        Some(dir) => {
            info!("Storing artifacts under {}", dir.display());
            Arc::new(LocalArtifactStore::new(dir.clone()))
        }
        None => Arc::new(HttpArtifactStore::new(client.clone())),
    };

    let engine = Arc::new(PipelineEngine::new(
        Arc::new(runtime),
        Arc::new(GitFetcher::new()),
        artifacts,
        Arc::new(HttpLogRepository::new(client.clone())),
        EngineConfig::from(&config),
    ));

    let reporter = StatusReporter::new(
        Arc::new(HttpStatusSink::new(client.clone())),
        RetryPolicy {
            max_attempts: config.report_max_attempts,
            initial_backoff: config.report_initial_backoff,
            max_backoff: config.report_max_backoff,
        },
    );

    let consumer = QueueConsumer::new(
        ConsumerConfig::from(&config),
        Arc::new(HttpMessageQueue::new(client.clone(), config.worker_id.clone())),
        Arc::new(HttpExecutionRepository::new(client, config.worker_id.clone())),
        engine,
        reporter,
    );

    info!("Worker initialized successfully");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            return;
        }
        info!("Interrupt received, stopping after running executions");
        signal.cancel();
    });

    if let Err(e) = consumer.run(shutdown).await {
        error!("Consumer error: {:#}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
