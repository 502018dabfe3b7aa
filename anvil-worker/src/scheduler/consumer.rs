//! Queue consumer
//!
//! Polls the queue for pipeline messages and starts one execution per valid
//! message. A message is only acknowledged after the execution has been
//! claimed with the controlling service, so a crash before that point leads
//! to redelivery rather than a lost or duplicated build.

use anvil_core::domain::event::{PIPELINE_UNIT_ID, StatusEvent};
use anvil_core::domain::failure::{FailureDetail, FailureKind};
use anvil_core::domain::pipeline::{PipelineDefinition, ValidationError};
use anvil_core::domain::state::{UnitKind, UnitState};
use anvil_core::dto::execution::ClaimOutcome;
use anvil_core::dto::queue::QueueMessage;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::PipelineEngine;
use crate::repository::{ExecutionRepository, MessageQueue};
use crate::scheduler::registry::ExecutionRegistry;
use crate::service::StatusReporter;

/// Consumer settings derived from the worker configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    /// Max executions running at once
    pub capacity: usize,
}

impl From<&Config> for ConsumerConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            cancel_poll_interval: config.cancel_poll_interval,
            capacity: config.max_concurrent_executions,
        }
    }
}

/// What happened to one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Claimed, acknowledged, and handed to the engine
    Started(Uuid),
    /// Invalid; rejected without requeue
    Rejected,
    /// Already running here or owned by another worker; acknowledged
    Duplicate,
    /// Could not be taken right now; rejected with requeue
    Deferred,
}

/// Polls the queue and runs accepted pipelines
pub struct QueueConsumer {
    config: ConsumerConfig,
    queue: Arc<dyn MessageQueue>,
    executions: Arc<dyn ExecutionRepository>,
    engine: Arc<PipelineEngine>,
    reporter: StatusReporter,
    registry: ExecutionRegistry,
    semaphore: Arc<Semaphore>,
}

impl QueueConsumer {
    pub fn new(
        config: ConsumerConfig,
        queue: Arc<dyn MessageQueue>,
        executions: Arc<dyn ExecutionRepository>,
        engine: Arc<PipelineEngine>,
        reporter: StatusReporter,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.capacity));
        Self {
            config,
            queue,
            executions,
            engine,
            reporter,
            registry: ExecutionRegistry::new(),
            semaphore,
        }
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Runs the polling loop until `shutdown` is triggered, then waits for
    /// running executions to finish
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting queue consumer (interval: {:?}, capacity: {})",
            self.config.poll_interval, self.config.capacity
        );

        let watcher = self.start_cancellation_watcher(shutdown.child_token());

        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            debug!("Polling for pipeline messages");

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} execution(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }

        info!(
            "Shutting down, waiting for {} running execution(s)",
            self.registry.active_count()
        );
        self.wait_idle().await;
        if let Err(e) = watcher.await {
            warn!("Cancellation watcher ended abnormally: {}", e);
        }
        info!("Queue consumer stopped");

        Ok(())
    }

    /// Performs a single poll cycle and returns the number of executions started
    pub async fn poll_once(&self) -> Result<usize> {
        let free = self.semaphore.available_permits();
        if free == 0 {
            debug!("At capacity, not receiving");
            return Ok(0);
        }

        let messages = self
            .queue
            .receive(free)
            .await
            .context("Failed to receive pipeline messages")?;

        let mut started = 0;
        for message in messages {
            let delivery_id = message.delivery_id.clone();
            match self.handle_message(message).await {
                Ok(Disposition::Started(_)) => started += 1,
                Ok(other) => debug!("Delivery {}: {:?}", delivery_id, other),
                Err(e) => error!("Failed to handle delivery {}: {:#}", delivery_id, e),
            }
        }

        Ok(started)
    }

    /// Validates, claims, acknowledges, and starts one message
    pub async fn handle_message(&self, message: QueueMessage) -> Result<Disposition> {
        let delivery_id = message.delivery_id.as_str();

        let definition = match PipelineDefinition::parse(&message.body) {
            Ok(definition) => definition,
            Err(e) => {
                warn!("Rejecting invalid pipeline message {}: {}", delivery_id, e);
                self.queue.reject(delivery_id, false).await?;
                self.report_invalid(&message.body, &e).await;
                return Ok(Disposition::Rejected);
            }
        };
        let execution_id = definition.execution_id;

        if self.registry.contains(execution_id) {
            info!(
                "Execution {} already running here, acknowledging redelivery",
                execution_id
            );
            self.queue.ack(delivery_id).await?;
            return Ok(Disposition::Duplicate);
        }

        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!("No capacity for execution {}, requeueing", execution_id);
            self.queue.reject(delivery_id, true).await?;
            return Ok(Disposition::Deferred);
        };

        match self.executions.claim(execution_id).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyClaimed) => {
                info!("Execution {} is owned by another worker", execution_id);
                self.queue.ack(delivery_id).await?;
                return Ok(Disposition::Duplicate);
            }
            Err(e) => {
                warn!("Could not claim execution {}: {:#}", execution_id, e);
                self.queue.reject(delivery_id, true).await?;
                return Ok(Disposition::Deferred);
            }
        }

        let cancel = CancellationToken::new();
        if !self.registry.try_insert(execution_id, cancel.clone()) {
            self.queue.ack(delivery_id).await?;
            return Ok(Disposition::Duplicate);
        }

        // Claimed: a lost ack now only causes a redelivery that is recognised
        if let Err(e) = self.queue.ack(delivery_id).await {
            warn!("Failed to ack delivery {}: {:#}", delivery_id, e);
        }

        info!("Claimed execution {}", execution_id);

        let reporter = self.reporter.open(execution_id);
        let engine = Arc::clone(&self.engine);
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let outcome = engine.run(definition, reporter, cancel).await;
            if outcome.degraded_reporting() {
                warn!(
                    "Execution {} ended {} with degraded reporting",
                    execution_id, outcome.state
                );
            }
            registry.remove(execution_id);
            drop(permit);
        });

        Ok(Disposition::Started(execution_id))
    }

    /// Asks the controller which executions to stop and cancels them
    pub async fn poll_cancellations(&self) -> Result<usize> {
        poll_cancellations(self.executions.as_ref(), &self.registry).await
    }

    /// Waits until no execution is running
    pub async fn wait_idle(&self) {
        let capacity = self.config.capacity as u32;
        match self.semaphore.acquire_many(capacity).await {
            Ok(permits) => drop(permits),
            Err(e) => error!("Capacity semaphore closed: {}", e),
        }
    }

    /// Emits the pipeline-level failure of a message that could not be accepted
    async fn report_invalid(&self, body: &str, error: &ValidationError) {
        let Some(execution_id) = PipelineDefinition::peek_execution_id(body) else {
            warn!("Invalid message carries no execution id, nothing to report");
            return;
        };

        let reporter = self.reporter.open(execution_id);
        reporter.report(StatusEvent::new(
            execution_id,
            UnitKind::Pipeline,
            PIPELINE_UNIT_ID,
            UnitState::Pending,
            UnitState::Failed,
            Some(FailureDetail::new(FailureKind::ValidationError, error.to_string())),
        ));
        reporter.close().await;
    }

    /// Starts a background task polling for cancellation requests
    fn start_cancellation_watcher(&self, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let executions = Arc::clone(&self.executions);
        let registry = self.registry.clone();
        let interval = self.config.cancel_poll_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if registry.active_count() == 0 {
                    continue;
                }

                debug!("Checking for cancellation requests");

                if let Err(e) = poll_cancellations(executions.as_ref(), &registry).await {
                    warn!("Failed to check cancellations: {:#}", e);
                }
            }
        })
    }
}

async fn poll_cancellations(
    executions: &dyn ExecutionRepository,
    registry: &ExecutionRegistry,
) -> Result<usize> {
    let requested = executions.pending_cancellations().await?;

    let mut cancelled = 0;
    for execution_id in requested {
        if registry.cancel(execution_id) {
            info!("Cancelling execution {} on request", execution_id);
            cancelled += 1;
        }
    }

    Ok(cancelled)
}
