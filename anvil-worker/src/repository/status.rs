//! Status repository
//!
//! Delivers single status updates. Retrying and ordering live in the
//! reporter service; this layer only performs one attempt and keeps the
//! typed error so the caller can tell transient from permanent failures.

use anvil_client::{ClientError, ControllerClient};
use anvil_core::dto::status::StatusUpdate;
use async_trait::async_trait;

/// Repository trait for status delivery
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Performs one delivery attempt
    ///
    /// A duplicate `event_id` must be accepted as already delivered.
    async fn deliver(&self, update: &StatusUpdate) -> Result<(), ClientError>;
}

/// HTTP implementation of StatusSink
pub struct HttpStatusSink {
    client: ControllerClient,
}

impl HttpStatusSink {
    pub fn new(client: ControllerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn deliver(&self, update: &StatusUpdate) -> Result<(), ClientError> {
        self.client.send_status(update).await
    }
}
