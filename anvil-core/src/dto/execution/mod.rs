//! Execution ownership DTOs

use serde::{Deserialize, Serialize};

/// Request to durably record that a worker owns an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
}

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimOutcome {
    /// This worker now owns the execution
    Claimed,
    /// Another claim (possibly an earlier one of ours) already exists
    AlreadyClaimed,
}
