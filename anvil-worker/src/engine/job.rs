//! Job task
//!
//! One task per job of the running stage. It runs the job's steps strictly
//! in order in the job's private workspace, and uploads declared artifacts
//! once every step succeeded. Progress goes back to the engine as
//! [`JobSignal`]s; the task never touches the execution state itself.

use anvil_core::domain::artifact::ArtifactKey;
use anvil_core::domain::event::{job_unit_id, step_unit_id};
use anvil_core::domain::failure::{FailureDetail, FailureKind};
use anvil_core::domain::log::StepOutput;
use anvil_core::domain::pipeline::JobDefinition;
use anvil_core::domain::state::UnitState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::{ArtifactStore, LogRepository};
use crate::runtime::{ContainerSpec, StepRunner};
use crate::service::ExecutionWorkspace;

/// Progress reported by a job task
#[derive(Debug, Clone)]
pub enum JobSignal {
    StepStarted {
        job: usize,
        step: usize,
    },
    StepFinished {
        job: usize,
        step: usize,
        state: UnitState,
        exit_code: Option<i32>,
        detail: Option<FailureDetail>,
    },
    JobFinished {
        job: usize,
        state: UnitState,
        detail: Option<FailureDetail>,
    },
}

/// Everything a job task needs, owned so it can be spawned
pub(crate) struct JobTask {
    pub execution_id: Uuid,
    pub stage_name: String,
    pub job_index: usize,
    pub job: JobDefinition,
    pub workspace: ExecutionWorkspace,
    pub runner: StepRunner,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub logs: Arc<dyn LogRepository>,
    pub default_timeout: Duration,
}

impl JobTask {
    /// Runs the job and always ends with a [`JobSignal::JobFinished`]
    pub async fn run(self, signals: UnboundedSender<JobSignal>, cancel: CancellationToken) {
        let (state, detail) = self.execute(&signals, &cancel).await;

        info!(
            "Job {} of execution {} finished: {}",
            self.unit_id(),
            self.execution_id,
            state
        );

        let _ = signals.send(JobSignal::JobFinished {
            job: self.job_index,
            state,
            detail,
        });
    }

    async fn execute(
        &self,
        signals: &UnboundedSender<JobSignal>,
        cancel: &CancellationToken,
    ) -> (UnitState, Option<FailureDetail>) {
        if cancel.is_cancelled() {
            return (UnitState::Cancelled, None);
        }

        let dir = match self
            .workspace
            .prepare_job(&self.stage_name, &self.job.name)
            .await
        {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to prepare workspace for {}: {}", self.unit_id(), e);
                let detail = FailureDetail::new(
                    FailureKind::WorkspaceError,
                    format!("failed to prepare workspace: {}", e),
                );
                return (UnitState::Failed, Some(detail.caused_by(&self.unit_id())));
            }
        };

        let timeout = self
            .job
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        for (index, step) in self.job.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("Job {} cancelled before step {}", self.unit_id(), index);
                return (UnitState::Cancelled, None);
            }

            let _ = signals.send(JobSignal::StepStarted {
                job: self.job_index,
                step: index,
            });

            let spec = ContainerSpec {
                name: self.container_name(index),
                image: self.job.image.clone(),
                command: step.command.clone(),
                env: self.job.step_env(step),
                workspace: dir.clone(),
                working_dir: self.job.working_dir.clone(),
            };

            let result = self.runner.execute(&spec, timeout, cancel).await;
            let step_id = step_unit_id(&self.stage_name, &self.job.name, index);
            self.ship_output(result.output.to_step_output(&step_id)).await;

            let state = result.state();
            let detail = result.failure();
            let _ = signals.send(JobSignal::StepFinished {
                job: self.job_index,
                step: index,
                state,
                exit_code: result.exit_code,
                detail: detail.clone(),
            });

            match state {
                UnitState::Succeeded => continue,
                UnitState::Cancelled => return (UnitState::Cancelled, None),
                _ => return (UnitState::Failed, detail.map(|d| d.caused_by(&step_id))),
            }
        }

        if let Err(detail) = self.upload_artifacts(&dir).await {
            return (UnitState::Failed, Some(detail.caused_by(&self.unit_id())));
        }

        (UnitState::Succeeded, None)
    }

    /// Stores every declared artifact; the first failure fails the job
    async fn upload_artifacts(&self, dir: &Path) -> Result<(), FailureDetail> {
        for name in &self.job.artifacts {
            let data = read_artifact(dir, name).await.map_err(|reason| {
                FailureDetail::new(
                    FailureKind::ArtifactUploadError,
                    format!("cannot read artifact '{}': {}", name, reason),
                )
            })?;

            let key = ArtifactKey::new(self.execution_id, &self.job.name, name);
            let size = data.len();
            self.artifacts.put(&key, data).await.map_err(|e| {
                FailureDetail::new(
                    FailureKind::ArtifactUploadError,
                    format!("failed to store artifact '{}': {}", key, e),
                )
            })?;

            info!("Stored artifact {} ({} bytes)", key, size);
        }

        Ok(())
    }

    /// Best effort; lost output never fails a step
    async fn ship_output(&self, output: StepOutput) {
        let unit_id = output.unit_id.clone();
        if let Err(e) = self.logs.send_step_output(self.execution_id, output).await {
            warn!("Failed to ship output of {}: {}", unit_id, e);
        }
    }

    fn unit_id(&self) -> String {
        job_unit_id(&self.stage_name, &self.job.name)
    }

    fn container_name(&self, step: usize) -> String {
        let execution = self.execution_id.simple().to_string();
        let nonce = Uuid::new_v4().simple().to_string();
        format!(
            "anvil-{}-{}-{}-{}-{}",
            &execution[..12],
            sanitize(&self.stage_name),
            sanitize(&self.job.name),
            step,
            &nonce[..8]
        )
    }
}

/// Restricts a name to characters container engines accept
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Reads a regular file that resolves to a location inside `dir`
///
/// Symlinked artifacts are refused, as are paths whose parent directories
/// lead out of the workspace.
async fn read_artifact(dir: &Path, name: &str) -> Result<Vec<u8>, String> {
    let root = tokio::fs::canonicalize(dir)
        .await
        .map_err(|e| e.to_string())?;
    let path = dir.join(name);

    let link = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|e| e.to_string())?;
    if link.file_type().is_symlink() {
        return Err("symbolic links are not uploaded".to_string());
    }

    let resolved = tokio::fs::canonicalize(&path)
        .await
        .map_err(|e| e.to_string())?;
    if !resolved.starts_with(&root) {
        return Err("resolves outside the job workspace".to_string());
    }
    if !link.is_file() {
        return Err("not a regular file".to_string());
    }

    tokio::fs::read(&resolved).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("unit tests"), "unit-tests");
        assert_eq!(sanitize("build_1.2"), "build_1.2");
        assert_eq!(sanitize("café"), "caf-");
    }
}
