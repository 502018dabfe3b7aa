//! Execution registry
//!
//! Process-wide map of the executions this worker currently runs. An entry
//! is inserted right after the execution is claimed and removed once the
//! engine returns, i.e. after the final status event has been delivered.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
struct ActiveExecution {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Shared handle to the set of running executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, ActiveExecution>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveExecution>> {
        // Entries stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an execution; `false` if it is already running here
    pub fn try_insert(&self, execution_id: Uuid, cancel: CancellationToken) -> bool {
        let mut map = self.lock();
        if map.contains_key(&execution_id) {
            return false;
        }
        map.insert(
            execution_id,
            ActiveExecution {
                cancel,
                started_at: Utc::now(),
            },
        );
        true
    }

    pub fn remove(&self, execution_id: Uuid) -> bool {
        self.lock().remove(&execution_id).is_some()
    }

    /// Triggers the cancellation token of a running execution
    ///
    /// Returns `false` when the execution is not running on this worker.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.lock().get(&execution_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.lock().contains_key(&execution_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Running executions, oldest first
    pub fn active_ids(&self) -> Vec<Uuid> {
        let map = self.lock();
        let mut active: Vec<_> = map.iter().map(|(id, a)| (a.started_at, *id)).collect();
        active.sort();
        active.into_iter().map(|(_, id)| id).collect()
    }
}
