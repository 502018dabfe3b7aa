//! Executions repository
//!
//! Handles execution ownership with the controlling service:
//! - Claiming an execution before its message is acknowledged
//! - Polling for executions that should be cancelled

use anvil_client::ControllerClient;
use anvil_core::dto::execution::ClaimOutcome;
use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository trait for execution ownership
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Durably records that this worker owns the execution
    ///
    /// # Arguments
    /// * `execution_id` - The execution to claim
    async fn claim(&self, execution_id: Uuid) -> Result<ClaimOutcome>;

    /// Executions owned by this worker that have been asked to stop
    async fn pending_cancellations(&self) -> Result<Vec<Uuid>>;
}

/// HTTP implementation of ExecutionRepository
pub struct HttpExecutionRepository {
    client: ControllerClient,
    worker_id: String,
}

impl HttpExecutionRepository {
    /// Creates a new HTTP execution repository
    ///
    /// # Arguments
    /// * `client` - Client for the controlling service
    /// * `worker_id` - Identifier executions are claimed under
    pub fn new(client: ControllerClient, worker_id: String) -> Self {
        Self { client, worker_id }
    }
}

#[async_trait]
impl ExecutionRepository for HttpExecutionRepository {
    async fn claim(&self, execution_id: Uuid) -> Result<ClaimOutcome> {
        self.client
            .claim_execution(execution_id, &self.worker_id)
            .await
            .with_context(|| format!("Failed to claim execution {}", execution_id))
    }

    async fn pending_cancellations(&self) -> Result<Vec<Uuid>> {
        self.client
            .pending_cancellations(&self.worker_id)
            .await
            .context("Failed to fetch pending cancellations")
    }
}
