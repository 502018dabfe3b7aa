//! Status update DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::event::StatusEvent;
use crate::domain::failure::FailureDetail;
use crate::domain::state::{UnitKind, UnitState};

/// Status update call sent to the controlling service
///
/// Idempotent on `event_id`: delivering the same update twice has no effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub execution_id: Uuid,
    pub unit_kind: UnitKind,
    pub unit_id: String,
    pub state: UnitState,
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureDetail>,
}

impl From<&StatusEvent> for StatusUpdate {
    fn from(event: &StatusEvent) -> Self {
        Self {
            execution_id: event.execution_id,
            unit_kind: event.unit_kind,
            unit_id: event.unit_id.clone(),
            state: event.new_state,
            timestamp: event.timestamp,
            event_id: event.event_id,
            detail: event.detail.clone(),
        }
    }
}
