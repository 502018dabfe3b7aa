//! Logs repository
//!
//! Ships captured step output to the controlling service.
//! Capture and truncation happen in the runtime layer.

use anvil_client::ControllerClient;
use anvil_core::domain::log::StepOutput;
use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository trait for step output
#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Sends the output of one step
    ///
    /// # Arguments
    /// * `execution_id` - The execution the step belongs to
    /// * `output` - Captured output, possibly truncated
    async fn send_step_output(&self, execution_id: Uuid, output: StepOutput) -> Result<()>;
}

/// HTTP implementation of LogRepository
pub struct HttpLogRepository {
    client: ControllerClient,
}

impl HttpLogRepository {
    pub fn new(client: ControllerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogRepository for HttpLogRepository {
    async fn send_step_output(&self, execution_id: Uuid, output: StepOutput) -> Result<()> {
        if output.output.is_empty() && output.truncated_bytes == 0 {
            return Ok(());
        }

        self.client
            .send_step_output(execution_id, &output)
            .await
            .with_context(|| format!("Failed to send output of {}", output.unit_id))
    }
}
