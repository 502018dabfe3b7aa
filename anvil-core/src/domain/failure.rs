//! Failure taxonomy
//!
//! Status events carry a [`FailureDetail`] explaining why a unit ended in
//! `FAILED` (or, for cancellations, why it was stopped).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of failure reported to the controlling service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Malformed pipeline definition, never retried
    ValidationError,
    /// Repository could not be fetched or the revision does not resolve
    SourceUnavailable,
    /// The container could not be created or started
    ContainerCreateError,
    /// The container runtime failed while the step was running
    ContainerRuntimeError,
    /// The step's command exited with a non-zero code
    NonZeroExit,
    /// The step exceeded its time budget
    StepTimeout,
    /// The unit was stopped by a cancellation signal
    Cancelled,
    /// A declared artifact could not be persisted
    ArtifactUploadError,
    /// The job workspace could not be prepared
    WorkspaceError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidationError => "ValidationError",
            Self::SourceUnavailable => "SourceUnavailable",
            Self::ContainerCreateError => "ContainerCreateError",
            Self::ContainerRuntimeError => "ContainerRuntimeError",
            Self::NonZeroExit => "NonZeroExit",
            Self::StepTimeout => "StepTimeout",
            Self::Cancelled => "Cancelled",
            Self::ArtifactUploadError => "ArtifactUploadError",
            Self::WorkspaceError => "WorkspaceError",
        };
        f.write_str(name)
    }
}

/// Why a unit failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    /// Unit that first failed, when this detail is propagated to a parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_unit: Option<String>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            root_unit: None,
        }
    }

    /// Copies this detail for a parent unit, pointing back at the failing unit
    pub fn caused_by(&self, unit_id: &str) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            root_unit: Some(self.root_unit.clone().unwrap_or_else(|| unit_id.to_string())),
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root_unit {
            Some(unit) => write!(f, "{} in '{}': {}", self.kind, unit, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
