//! Execution endpoints

use crate::ControllerClient;
use crate::error::Result;
use anvil_core::domain::log::StepOutput;
use anvil_core::dto::execution::{ClaimOutcome, ClaimRequest};
use anvil_core::dto::status::StatusUpdate;
use uuid::Uuid;

impl ControllerClient {
    // =============================================================================
    // Execution Ownership
    // =============================================================================

    /// Durably claim an execution for this worker
    ///
    /// A `409 Conflict` means someone already owns it and is reported as
    /// [`ClaimOutcome::AlreadyClaimed`] rather than an error.
    pub async fn claim_execution(&self, execution_id: Uuid, worker_id: &str) -> Result<ClaimOutcome> {
        let url = format!("{}/api/executions/{}/claim", self.base_url, execution_id);
        let response = self
            .client
            .post(&url)
            .json(&ClaimRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;

        match self.handle_empty_response(response).await {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(e) if e.is_conflict() => Ok(ClaimOutcome::AlreadyClaimed),
            Err(e) => Err(e),
        }
    }

    /// List executions owned by this worker that should be cancelled
    pub async fn pending_cancellations(&self, worker_id: &str) -> Result<Vec<Uuid>> {
        let url = format!("{}/api/workers/{}/cancellations", self.base_url, worker_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Progress
    // =============================================================================

    /// Send one status update
    ///
    /// The controller deduplicates on `event_id`; a `409 Conflict` for an
    /// already-recorded event is treated as success.
    pub async fn send_status(&self, update: &StatusUpdate) -> Result<()> {
        let url = format!(
            "{}/api/executions/{}/status",
            self.base_url, update.execution_id
        );
        let response = self.client.post(&url).json(update).send().await?;

        match self.handle_empty_response(response).await {
            Err(e) if e.is_conflict() => {
                tracing::debug!("Status event {} already recorded", update.event_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Send the captured output of one step
    pub async fn send_step_output(&self, execution_id: Uuid, output: &StepOutput) -> Result<()> {
        let url = format!("{}/api/executions/{}/logs", self.base_url, execution_id);
        let response = self.client.post(&url).json(output).send().await?;

        self.handle_empty_response(response).await
    }
}
