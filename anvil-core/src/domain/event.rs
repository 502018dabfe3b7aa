//! Status events
//!
//! A [`StatusEvent`] is the immutable record of one unit transition. The
//! engine produces them; the status reporter delivers them in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::failure::FailureDetail;
use crate::domain::state::{UnitKind, UnitState};

/// One state transition of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Unique per event; the receiving side deduplicates on it
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub unit_kind: UnitKind,
    /// Slash-separated path: `pipeline`, `<stage>`, `<stage>/<job>`,
    /// `<stage>/<job>/<step index>`
    pub unit_id: String,
    pub old_state: UnitState,
    pub new_state: UnitState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureDetail>,
}

impl StatusEvent {
    pub fn new(
        execution_id: Uuid,
        unit_kind: UnitKind,
        unit_id: impl Into<String>,
        old_state: UnitState,
        new_state: UnitState,
        detail: Option<FailureDetail>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            execution_id,
            unit_kind,
            unit_id: unit_id.into(),
            old_state,
            new_state,
            timestamp: Utc::now(),
            detail,
        }
    }

    /// True when this event moves the whole pipeline into a terminal state
    pub fn is_pipeline_terminal(&self) -> bool {
        self.unit_kind == UnitKind::Pipeline && self.new_state.is_terminal()
    }
}

/// Unit identifier of the pipeline itself
pub const PIPELINE_UNIT_ID: &str = "pipeline";

pub fn stage_unit_id(stage: &str) -> String {
    stage.to_string()
}

pub fn job_unit_id(stage: &str, job: &str) -> String {
    format!("{}/{}", stage, job)
}

pub fn step_unit_id(stage: &str, job: &str, index: usize) -> String {
    format!("{}/{}/{}", stage, job, index)
}
