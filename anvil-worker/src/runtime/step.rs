//! Step execution
//!
//! Runs one step through a [`ContainerRuntime`]: create, start, wait with a
//! time budget while watching the cancellation token, collect output, and
//! remove the container no matter how the step ended.

use anvil_core::domain::failure::{FailureDetail, FailureKind};
use anvil_core::domain::state::UnitState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CapturedOutput, ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};

/// Why a step did not complete with an exit code
#[derive(Debug, Error)]
pub enum StepError {
    /// The container could not be created or started
    #[error("{0}")]
    Create(RuntimeError),

    /// The runtime failed while the container was running
    #[error("{0}")]
    Runtime(RuntimeError),

    #[error("step exceeded its timeout of {0:?}")]
    Timeout(Duration),

    /// Not a failure: the step was stopped on request
    #[error("step was cancelled")]
    Cancelled,
}

/// Outcome of one step invocation
#[derive(Debug)]
pub struct ExecutionResult {
    /// Exit code, when the container ran to completion
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub error: Option<StepError>,
}

impl ExecutionResult {
    fn failed(error: StepError, output: CapturedOutput) -> Self {
        Self {
            exit_code: None,
            output,
            error: Some(error),
        }
    }

    /// Terminal state of the step this result belongs to
    pub fn state(&self) -> UnitState {
        match (&self.error, self.exit_code) {
            (Some(StepError::Cancelled), _) => UnitState::Cancelled,
            (Some(_), _) => UnitState::Failed,
            (None, Some(0)) => UnitState::Succeeded,
            (None, _) => UnitState::Failed,
        }
    }

    /// Failure detail for a non-successful result
    pub fn failure(&self) -> Option<FailureDetail> {
        let detail = match (&self.error, self.exit_code) {
            (Some(StepError::Create(e)), _) => {
                FailureDetail::new(FailureKind::ContainerCreateError, e.to_string())
            }
            (Some(StepError::Runtime(e)), _) => {
                FailureDetail::new(FailureKind::ContainerRuntimeError, e.to_string())
            }
            (Some(e @ StepError::Timeout(_)), _) => {
                FailureDetail::new(FailureKind::StepTimeout, e.to_string())
            }
            (Some(StepError::Cancelled), _) => {
                FailureDetail::new(FailureKind::Cancelled, "step was cancelled")
            }
            (None, Some(0)) => return None,
            (None, Some(code)) => {
                FailureDetail::new(FailureKind::NonZeroExit, format!("exited with code {}", code))
            }
            (None, None) => FailureDetail::new(
                FailureKind::ContainerRuntimeError,
                "container finished without an exit code",
            ),
        };
        Some(detail)
    }
}

/// Removes a created container when dropped without being released
///
/// Covers the path where the step future itself is dropped mid-flight.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    handle: Option<ContainerHandle>,
}

impl ContainerGuard {
    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.runtime.remove(&handle).await {
                warn!("Failed to remove container {}: {}", handle.id, e);
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        warn!("Step abandoned, removing container {} in background", handle.id);
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let _ = runtime.terminate(&handle).await;
                    if let Err(e) = runtime.remove(&handle).await {
                        warn!("Failed to remove container {}: {}", handle.id, e);
                    }
                });
            }
            Err(_) => warn!("No async runtime left to remove container {}", handle.id),
        }
    }
}

enum Waited {
    Exited(Result<i32, RuntimeError>),
    Cancelled,
}

/// Executes steps through a container runtime
#[derive(Clone)]
pub struct StepRunner {
    runtime: Arc<dyn ContainerRuntime>,
    output_limit: usize,
}

impl StepRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, output_limit: usize) -> Self {
        Self {
            runtime,
            output_limit,
        }
    }

    /// Runs one step to completion, timeout, or cancellation
    ///
    /// The container is always removed before this returns. A cancellation
    /// observed before the container exists skips creation entirely.
    pub async fn execute(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if cancel.is_cancelled() {
            return ExecutionResult::failed(StepError::Cancelled, self.empty_output());
        }

        let handle = match self.runtime.create(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to create container {}: {}", spec.name, e);
                return ExecutionResult::failed(StepError::Create(e), self.empty_output());
            }
        };
        debug!("Container {} created for image {}", handle.id, spec.image);

        let guard = ContainerGuard {
            runtime: Arc::clone(&self.runtime),
            handle: Some(handle.clone()),
        };

        let result = self.run_created(&handle, timeout, cancel).await;
        guard.release().await;
        result
    }

    async fn run_created(
        &self,
        handle: &ContainerHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        if let Err(e) = self.runtime.start(handle).await {
            let output = self.collect_output(handle).await;
            return ExecutionResult::failed(StepError::Create(e), output);
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            result = self.runtime.wait(handle, timeout) => Waited::Exited(result),
        };

        match waited {
            Waited::Exited(Ok(code)) => ExecutionResult {
                exit_code: Some(code),
                output: self.collect_output(handle).await,
                error: None,
            },
            Waited::Exited(Err(RuntimeError::Timeout(limit))) => {
                warn!("Container {} timed out after {:?}", handle.id, limit);
                self.terminate(handle).await;
                let output = self.collect_output(handle).await;
                ExecutionResult::failed(StepError::Timeout(limit), output)
            }
            Waited::Exited(Err(e)) => {
                warn!("Container {} failed while running: {}", handle.id, e);
                self.terminate(handle).await;
                let output = self.collect_output(handle).await;
                ExecutionResult::failed(StepError::Runtime(e), output)
            }
            Waited::Cancelled => {
                debug!("Cancelling container {}", handle.id);
                self.terminate(handle).await;
                let output = self.collect_output(handle).await;
                ExecutionResult::failed(StepError::Cancelled, output)
            }
        }
    }

    async fn terminate(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.terminate(handle).await {
            warn!("Failed to terminate container {}: {}", handle.id, e);
        }
    }

    async fn collect_output(&self, handle: &ContainerHandle) -> CapturedOutput {
        match self.runtime.logs(handle, self.output_limit).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to read logs of container {}: {}", handle.id, e);
                self.empty_output()
            }
        }
    }

    fn empty_output(&self) -> CapturedOutput {
        CapturedOutput::new(self.output_limit)
    }
}
