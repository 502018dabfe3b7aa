//! Pipeline execution engine
//!
//! Turns a validated [`PipelineDefinition`] into container executions:
//! - the source is fetched once, before any stage
//! - stages run strictly in order
//! - jobs of a stage run concurrently, one task each
//! - the first failing job cancels its siblings and halts later stages
//!
//! Job tasks report progress over a channel; the engine is the only writer
//! of the [`Execution`] and turns every transition into a status event.

pub mod execution;
mod job;

use anvil_core::domain::event::StatusEvent;
use anvil_core::domain::failure::{FailureDetail, FailureKind};
use anvil_core::domain::pipeline::PipelineDefinition;
use anvil_core::domain::state::UnitState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::repository::{ArtifactStore, LogRepository};
use crate::runtime::{ContainerRuntime, StepRunner};
use crate::service::{
    DeliverySummary, ExecutionReporter, ExecutionWorkspace, FetchError, RepositoryFetcher,
};

pub use execution::{Execution, UnitRef};
use job::{JobSignal, JobTask};

/// Engine settings derived from the worker configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub step_timeout: Duration,
    pub fetch_timeout: Duration,
    pub workspace_base: PathBuf,
    pub keep_workspaces: bool,
    pub step_output_limit: usize,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            step_timeout: config.step_timeout,
            fetch_timeout: config.fetch_timeout,
            workspace_base: config.workspace_base.clone(),
            keep_workspaces: config.keep_workspaces,
            step_output_limit: config.step_output_limit,
        }
    }
}

/// How one execution ended
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    /// Terminal pipeline state
    pub state: UnitState,
    pub root_cause: Option<FailureDetail>,
    pub delivery: DeliverySummary,
    /// Final execution record
    pub execution: Execution,
}

impl ExecutionOutcome {
    pub fn degraded_reporting(&self) -> bool {
        self.execution.degraded_reporting()
    }
}

/// Runs pipelines against a container runtime
pub struct PipelineEngine {
    runner: StepRunner,
    fetcher: Arc<dyn RepositoryFetcher>,
    artifacts: Arc<dyn ArtifactStore>,
    logs: Arc<dyn LogRepository>,
    config: EngineConfig,
}

impl PipelineEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn RepositoryFetcher>,
        artifacts: Arc<dyn ArtifactStore>,
        logs: Arc<dyn LogRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runner: StepRunner::new(runtime, config.step_output_limit),
            fetcher,
            artifacts,
            logs,
            config,
        }
    }

    /// Runs one pipeline to a terminal state
    ///
    /// Returns once the final pipeline event has been delivered or given up
    /// on, and the execution's workspace has been released.
    ///
    /// # Arguments
    /// * `definition` - A validated pipeline definition
    /// * `reporter` - Status queue opened for this execution
    /// * `cancel` - Cancels the whole execution when triggered
    pub async fn run(
        &self,
        definition: PipelineDefinition,
        reporter: ExecutionReporter,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let execution_id = definition.execution_id;
        info!(
            "Starting execution {} of {}@{} ({} stage(s), {} job(s))",
            execution_id,
            definition.repository_url,
            definition.revision,
            definition.stages.len(),
            definition.job_count()
        );

        let mut run = Run {
            execution: Execution::new(&definition),
            reporter: &reporter,
        };
        let workspace = ExecutionWorkspace::new(&self.config.workspace_base, execution_id);

        match self.fetch_source(&definition, &workspace, &cancel).await {
            Ok(source) => {
                let workspace = workspace.clone().with_source(source);
                self.run_stages(&mut run, &definition, &workspace, &cancel)
                    .await;
            }
            Err(None) => {
                info!("Execution {} cancelled while fetching source", execution_id);
                run.execution.request_cancel();
                let skipped = run.execution.cancel_pending_from(0);
                run.report_all(skipped);
                run.transition(UnitRef::Pipeline, UnitState::Cancelled, None);
            }
            Err(Some(detail)) => {
                warn!("Execution {} failed: {}", execution_id, detail);
                let skipped = run.execution.cancel_pending_from(0);
                run.report_all(skipped);
                run.transition(UnitRef::Pipeline, UnitState::Failed, Some(detail));
            }
        }

        let mut execution = run.execution;
        let delivery = reporter.close().await;
        if delivery.is_degraded() {
            execution.mark_degraded_reporting();
        }

        if self.config.keep_workspaces {
            info!("Keeping workspace {}", workspace.root().display());
        } else {
            workspace.cleanup().await;
        }

        info!(
            "Execution {} finished: {} ({} event(s) delivered, {} failed)",
            execution_id,
            execution.state(),
            delivery.delivered,
            delivery.failed
        );

        ExecutionOutcome {
            execution_id,
            state: execution.state(),
            root_cause: execution.root_cause().cloned(),
            delivery,
            execution,
        }
    }

    /// Fetches the source, bounded by the fetch timeout
    ///
    /// `Err(None)` means the execution was cancelled meanwhile.
    async fn fetch_source(
        &self,
        definition: &PipelineDefinition,
        workspace: &ExecutionWorkspace,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, Option<FailureDetail>> {
        let fetch = self.fetcher.fetch(
            &definition.repository_url,
            &definition.revision,
            workspace.source_dir(),
        );

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(None),
            fetched = tokio::time::timeout(self.config.fetch_timeout, fetch) => fetched,
        };

        match fetched {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(FetchError::SourceUnavailable(reason))) => Err(Some(FailureDetail::new(
                FailureKind::SourceUnavailable,
                reason,
            ))),
            Err(_) => Err(Some(FailureDetail::new(
                FailureKind::SourceUnavailable,
                format!(
                    "fetching {}@{} timed out after {:?}",
                    definition.repository_url, definition.revision, self.config.fetch_timeout
                ),
            ))),
        }
    }

    async fn run_stages(
        &self,
        run: &mut Run<'_>,
        definition: &PipelineDefinition,
        workspace: &ExecutionWorkspace,
        cancel: &CancellationToken,
    ) {
        let mut halted = None;

        for (index, stage) in definition.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                halted = Some(UnitState::Cancelled);
                break;
            }

            if index == 0 {
                run.transition(UnitRef::Pipeline, UnitState::Running, None);
            }

            let state = self
                .run_stage(run, index, &stage.name, definition, workspace, cancel)
                .await;
            if state != UnitState::Succeeded {
                info!("Stage '{}' ended {}, halting pipeline", stage.name, state);
                halted = Some(state);
                break;
            }
        }

        let remaining = run
            .execution
            .stages()
            .iter()
            .position(|s| s.state == UnitState::Pending)
            .unwrap_or(definition.stages.len());
        let skipped = run.execution.cancel_pending_from(remaining);
        run.report_all(skipped);

        match halted {
            None => run.transition(UnitRef::Pipeline, UnitState::Succeeded, None),
            Some(UnitState::Failed) => {
                let detail = run.execution.root_cause().cloned();
                run.transition(UnitRef::Pipeline, UnitState::Failed, detail);
            }
            Some(_) => {
                run.execution.request_cancel();
                run.transition(UnitRef::Pipeline, UnitState::Cancelled, None);
            }
        }
    }

    /// Runs all jobs of one stage and returns the stage's terminal state
    async fn run_stage(
        &self,
        run: &mut Run<'_>,
        stage_index: usize,
        stage_name: &str,
        definition: &PipelineDefinition,
        workspace: &ExecutionWorkspace,
        cancel: &CancellationToken,
    ) -> UnitState {
        info!(
            "Execution {}: starting stage '{}'",
            definition.execution_id, stage_name
        );
        run.transition(UnitRef::Stage(stage_index), UnitState::Running, None);

        let stage_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for (job_index, job) in definition.stages[stage_index].jobs.iter().enumerate() {
            let task = JobTask {
                execution_id: definition.execution_id,
                stage_name: stage_name.to_string(),
                job_index,
                job: job.clone(),
                workspace: workspace.clone(),
                runner: self.runner.clone(),
                artifacts: Arc::clone(&self.artifacts),
                logs: Arc::clone(&self.logs),
                default_timeout: self.config.step_timeout,
            };
            tasks.spawn(task.run(tx.clone(), stage_cancel.clone()));
        }
        drop(tx);

        // Closes once every job task has finished or died
        while let Some(signal) = rx.recv().await {
            if run.apply(stage_index, signal) == Some(UnitState::Failed)
                && !stage_cancel.is_cancelled()
            {
                info!("Job failed in stage '{}', cancelling siblings", stage_name);
                stage_cancel.cancel();
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Job task in stage '{}' ended abnormally: {}", stage_name, e);
            }
        }

        run.settle_abandoned_jobs(stage_index);

        let state = UnitState::aggregate(
            run.execution.stages()[stage_index]
                .jobs
                .iter()
                .map(|j| j.state),
        )
        .unwrap_or(UnitState::Failed);

        let detail = match state {
            UnitState::Failed => run.execution.root_cause().cloned(),
            _ => None,
        };
        run.transition(UnitRef::Stage(stage_index), state, detail);
        state
    }
}

/// Scheduling context of one execution
struct Run<'a> {
    execution: Execution,
    reporter: &'a ExecutionReporter,
}

impl Run<'_> {
    fn transition(&mut self, unit: UnitRef, to: UnitState, detail: Option<FailureDetail>) {
        match self.execution.transition(unit, to, detail) {
            Ok(event) => {
                self.reporter.report(event);
            }
            Err(e) => error!("Execution {}: {}", self.execution.id(), e),
        }
    }

    fn report_all(&self, events: Vec<StatusEvent>) {
        for event in events {
            self.reporter.report(event);
        }
    }

    /// Applies one job signal; returns the job's terminal state if it finished
    fn apply(&mut self, stage: usize, signal: JobSignal) -> Option<UnitState> {
        match signal {
            JobSignal::StepStarted { job, step } => {
                if self.execution.state_of(UnitRef::Job(stage, job)) == UnitState::Pending {
                    self.transition(UnitRef::Job(stage, job), UnitState::Running, None);
                }
                self.transition(UnitRef::Step(stage, job, step), UnitState::Running, None);
                None
            }
            JobSignal::StepFinished {
                job,
                step,
                state,
                exit_code,
                detail,
            } => {
                self.execution.record_exit_code(stage, job, step, exit_code);
                let detail = if state == UnitState::Succeeded { None } else { detail };
                self.transition(UnitRef::Step(stage, job, step), state, detail);
                None
            }
            JobSignal::JobFinished { job, state, detail } => {
                let skipped = self.execution.cancel_pending_steps(stage, job);
                self.report_all(skipped);
                self.transition(UnitRef::Job(stage, job), state, detail);
                Some(state)
            }
        }
    }

    /// Fails jobs whose task died without reporting a terminal state
    fn settle_abandoned_jobs(&mut self, stage: usize) {
        let detail = FailureDetail::new(
            FailureKind::ContainerRuntimeError,
            "job task ended unexpectedly",
        );

        for job in 0..self.execution.stages()[stage].jobs.len() {
            if self.execution.state_of(UnitRef::Job(stage, job)).is_terminal() {
                continue;
            }

            let steps = self.execution.stages()[stage].jobs[job].steps.len();
            for step in 0..steps {
                if self.execution.state_of(UnitRef::Step(stage, job, step)) == UnitState::Running {
                    self.transition(
                        UnitRef::Step(stage, job, step),
                        UnitState::Failed,
                        Some(detail.clone()),
                    );
                }
            }
            let skipped = self.execution.cancel_pending_steps(stage, job);
            self.report_all(skipped);
            self.transition(UnitRef::Job(stage, job), UnitState::Failed, Some(detail.clone()));
        }
    }
}
