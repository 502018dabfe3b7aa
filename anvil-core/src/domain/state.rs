//! Unit state machine
//!
//! Every schedulable unit (pipeline, stage, job, step) moves through the same
//! states: `PENDING → RUNNING → {SUCCEEDED | FAILED | CANCELLED}`. A unit that
//! never started may also go straight from `PENDING` to a terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Execution state of a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl UnitState {
    /// Returns true for `SUCCEEDED`, `FAILED` and `CANCELLED`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Checks whether moving from `self` to `next` is allowed
    ///
    /// Transitions are monotonic: nothing leaves a terminal state and a
    /// running unit cannot go back to pending.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Folds the terminal states of child units into the parent's state
    ///
    /// Any `FAILED` child fails the parent, otherwise any `CANCELLED` child
    /// cancels it. An empty set or all-`SUCCEEDED` set succeeds. Returns
    /// `None` while some child is still non-terminal.
    pub fn aggregate<I>(children: I) -> Option<UnitState>
    where
        I: IntoIterator<Item = UnitState>,
    {
        let mut failed = false;
        let mut cancelled = false;
        for state in children {
            match state {
                Self::Failed => failed = true,
                Self::Cancelled => cancelled = true,
                Self::Succeeded => {}
                Self::Pending | Self::Running => return None,
            }
        }

        if failed {
            Some(Self::Failed)
        } else if cancelled {
            Some(Self::Cancelled)
        } else {
            Some(Self::Succeeded)
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Level of the pipeline hierarchy a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitKind {
    Pipeline,
    Stage,
    Job,
    Step,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pipeline => "pipeline",
            Self::Stage => "stage",
            Self::Job => "job",
            Self::Step => "step",
        };
        f.write_str(name)
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for {kind} '{unit_id}': {from} -> {to}")]
pub struct TransitionError {
    pub kind: UnitKind,
    pub unit_id: String,
    pub from: UnitState,
    pub to: UnitState,
}
