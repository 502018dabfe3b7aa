//! Queue DTOs

use serde::{Deserialize, Serialize};

/// One message handed out by the queue
///
/// `body` is opaque to the queue; the worker parses it as a
/// `PipelineDefinition`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub delivery_id: String,
    pub body: String,
}

/// Negative acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    /// `false` drops the message permanently
    pub requeue: bool,
}
