//! Queue repository
//!
//! Receives pipeline messages and settles them:
//! - `ack` removes the message for good
//! - `reject` either drops it or makes it visible again

use anvil_client::ControllerClient;
use anvil_core::dto::queue::QueueMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Repository trait for the pipeline message queue
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receives up to `max` messages
    ///
    /// Received messages stay invisible to other consumers until they are
    /// settled or their lease expires.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledges a delivery
    ///
    /// # Arguments
    /// * `delivery_id` - The delivery to acknowledge
    async fn ack(&self, delivery_id: &str) -> Result<()>;

    /// Rejects a delivery
    ///
    /// # Arguments
    /// * `delivery_id` - The delivery to reject
    /// * `requeue` - Whether the message should be delivered again
    async fn reject(&self, delivery_id: &str, requeue: bool) -> Result<()>;
}

/// HTTP implementation of MessageQueue
pub struct HttpMessageQueue {
    client: ControllerClient,
    worker_id: String,
}

impl HttpMessageQueue {
    /// Creates a new HTTP queue repository
    ///
    /// # Arguments
    /// * `client` - Client for the controlling service
    /// * `worker_id` - Identifier this worker receives messages under
    pub fn new(client: ControllerClient, worker_id: String) -> Self {
        Self { client, worker_id }
    }
}

#[async_trait]
impl MessageQueue for HttpMessageQueue {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>> {
        self.client
            .receive_messages(&self.worker_id, max)
            .await
            .context("Failed to receive queue messages")
    }

    async fn ack(&self, delivery_id: &str) -> Result<()> {
        self.client
            .ack_message(delivery_id)
            .await
            .with_context(|| format!("Failed to ack delivery {}", delivery_id))
    }

    async fn reject(&self, delivery_id: &str, requeue: bool) -> Result<()> {
        self.client
            .reject_message(delivery_id, requeue)
            .await
            .with_context(|| format!("Failed to reject delivery {}", delivery_id))
    }
}
