//! Status reporter
//!
//! Each execution gets its own delivery task fed by an unbounded channel:
//! - `report` never blocks the engine
//! - events are delivered one at a time, in the order they were reported
//! - transient failures are retried with exponential backoff
//!
//! An event that cannot be delivered marks the execution's reporting as
//! degraded; delivery then moves on to the next event. Duplicate deliveries
//! after an ambiguous failure are harmless since the controlling service
//! deduplicates on `event_id`.

use anvil_client::ClientError;
use anvil_core::domain::event::StatusEvent;
use anvil_core::dto::status::StatusUpdate;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::StatusSink;

/// Retry schedule for a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Counts of what happened to the events of one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliverySummary {
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}

/// Factory for per-execution reporters sharing one sink
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
    policy: RetryPolicy,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    /// Starts the delivery task for one execution
    pub fn open(&self, execution_id: Uuid) -> ExecutionReporter {
        let (tx, rx) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(deliver_all(
            execution_id,
            Arc::clone(&self.sink),
            self.policy,
            rx,
            Arc::clone(&degraded),
        ));

        ExecutionReporter {
            execution_id,
            tx,
            degraded,
            worker,
        }
    }
}

/// Ordered, non-blocking event queue of one execution
pub struct ExecutionReporter {
    execution_id: Uuid,
    tx: mpsc::UnboundedSender<StatusEvent>,
    degraded: Arc<AtomicBool>,
    worker: JoinHandle<DeliverySummary>,
}

impl ExecutionReporter {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Enqueues an event for delivery
    ///
    /// Returns `false` if the delivery task is gone, in which case the
    /// execution is flagged as degraded.
    pub fn report(&self, event: StatusEvent) -> bool {
        debug!(
            "Reporting {} {}: {} -> {}",
            event.unit_kind, event.unit_id, event.old_state, event.new_state
        );
        if self.tx.send(event).is_err() {
            error!(
                "Status delivery for execution {} is no longer running",
                self.execution_id
            );
            self.degraded.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Whether any event has been given up on so far
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Stops accepting events and waits until every queued event has been
    /// delivered or given up on
    pub async fn close(self) -> DeliverySummary {
        let Self {
            execution_id,
            tx,
            degraded,
            worker,
        } = self;
        drop(tx);

        match worker.await {
            Ok(summary) => {
                if summary.is_degraded() || degraded.load(Ordering::SeqCst) {
                    warn!(
                        "Execution {} finished with degraded reporting ({} delivered, {} failed)",
                        execution_id, summary.delivered, summary.failed
                    );
                }
                summary
            }
            Err(e) => {
                error!("Status delivery task for {} failed: {}", execution_id, e);
                DeliverySummary {
                    delivered: 0,
                    failed: 1,
                }
            }
        }
    }
}

async fn deliver_all(
    execution_id: Uuid,
    sink: Arc<dyn StatusSink>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    degraded: Arc<AtomicBool>,
) -> DeliverySummary {
    let mut summary = DeliverySummary::default();

    while let Some(event) = rx.recv().await {
        let update = StatusUpdate::from(&event);
        match deliver_with_retry(sink.as_ref(), &policy, &update).await {
            Ok(()) => summary.delivered += 1,
            Err(e) => {
                error!(
                    "Giving up on status event {} ({} {} -> {}) of execution {}: {}",
                    update.event_id, update.unit_kind, update.unit_id, update.state, execution_id, e
                );
                degraded.store(true, Ordering::SeqCst);
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Delivers one update, retrying transient failures with exponential backoff
async fn deliver_with_retry(
    sink: &dyn StatusSink,
    policy: &RetryPolicy,
    update: &StatusUpdate,
) -> Result<(), ClientError> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        match sink.deliver(update).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(
                        "Delivered status event {} after {} attempt(s)",
                        update.event_id, attempt
                    );
                }
                return Ok(());
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(e);
                }

                let delay = policy.backoff(attempt);
                warn!(
                    "Status delivery attempt {}/{} for {} failed: {}. Retrying in {:?}",
                    attempt, policy.max_attempts, update.event_id, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
