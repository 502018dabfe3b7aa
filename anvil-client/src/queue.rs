//! Queue endpoints

use crate::ControllerClient;
use crate::error::Result;
use anvil_core::dto::queue::{QueueMessage, RejectRequest};

impl ControllerClient {
    // =============================================================================
    // Queue
    // =============================================================================

    /// Receive up to `max` pending pipeline messages for this worker
    ///
    /// Received messages stay invisible to other workers until they are
    /// acknowledged, rejected, or their visibility lease expires.
    pub async fn receive_messages(&self, worker_id: &str, max: usize) -> Result<Vec<QueueMessage>> {
        let url = format!("{}/api/queue/messages", self.base_url);
        let max = max.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("worker_id", worker_id), ("max", max.as_str())])
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Acknowledge a delivery, removing the message from the queue
    pub async fn ack_message(&self, delivery_id: &str) -> Result<()> {
        let url = format!("{}/api/queue/messages/{}/ack", self.base_url, delivery_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Reject a delivery
    ///
    /// # Arguments
    /// * `delivery_id` - The delivery to reject
    /// * `requeue` - `true` makes the message available again, `false` drops it
    pub async fn reject_message(&self, delivery_id: &str, requeue: bool) -> Result<()> {
        let url = format!("{}/api/queue/messages/{}/reject", self.base_url, delivery_id);
        let response = self
            .client
            .post(&url)
            .json(&RejectRequest { requeue })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
