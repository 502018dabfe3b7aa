//! Step output domain types

use serde::{Deserialize, Serialize};

/// Captured output of one step, shipped to the controlling service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub unit_id: String,
    /// Combined stdout/stderr, lossily decoded as UTF-8
    pub output: String,
    /// Leading bytes dropped because the output exceeded the capture limit
    pub truncated_bytes: u64,
}
