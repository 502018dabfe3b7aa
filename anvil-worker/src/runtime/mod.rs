//! Container runtime adapter
//!
//! [`ContainerRuntime`] is the capability interface every backend implements
//! (create, start, wait, logs, terminate, remove). [`StepRunner`] drives one
//! step through it and guarantees the container is removed on every path.

pub mod output;
pub mod podman;
pub mod step;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use output::CapturedOutput;
pub use podman::{CliRuntime, ContainerEngine};
pub use step::{ExecutionResult, StepError, StepRunner};

/// Mount point of the job workspace inside every container
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Everything needed to create the container for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, unique per step invocation
    pub name: String,
    pub image: String,
    /// Shell command line run with `/bin/sh -c`
    pub command: String,
    pub env: HashMap<String, String>,
    /// Host directory mounted at [`WORKSPACE_MOUNT`]
    pub workspace: PathBuf,
    /// Working directory relative to the workspace mount
    pub working_dir: Option<String>,
}

impl ContainerSpec {
    /// Absolute working directory inside the container
    pub fn container_workdir(&self) -> String {
        match &self.working_dir {
            Some(dir) => format!("{}/{}", WORKSPACE_MOUNT, dir.trim_start_matches("./")),
            None => WORKSPACE_MOUNT.to_string(),
        }
    }
}

/// Opaque reference to a created container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

/// Errors reported by a container backend
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to create container: {0}")]
    Create(String),

    #[error("failed to start container: {0}")]
    Start(String),

    #[error("container did not exit within {0:?}")]
    Timeout(Duration),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("failed to invoke container engine: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform interface over container backends
///
/// Implementations are selected at worker startup; the engine only ever
/// talks to this trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates (but does not start) the container for a step
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Waits for the container to exit and returns its exit code
    ///
    /// Returns [`RuntimeError::Timeout`] if it is still running after
    /// `timeout`; the container is left running for the caller to terminate.
    async fn wait(&self, handle: &ContainerHandle, timeout: Duration) -> Result<i32, RuntimeError>;

    /// Combined stdout/stderr produced so far, keeping at most the last
    /// `limit` bytes of each stream
    async fn logs(
        &self,
        handle: &ContainerHandle,
        limit: usize,
    ) -> Result<CapturedOutput, RuntimeError>;

    /// Forcefully stops a running container
    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Deletes the container; must succeed for already-stopped containers
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
