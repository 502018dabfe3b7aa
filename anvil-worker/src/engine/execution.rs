//! Execution state
//!
//! [`Execution`] is the in-memory record of one pipeline run: the state of
//! every stage, job, and step, plus the first failure seen. Only the engine's
//! scheduling loop mutates it; every accepted transition yields the
//! [`StatusEvent`] to report.

use anvil_core::domain::event::{
    PIPELINE_UNIT_ID, StatusEvent, job_unit_id, stage_unit_id, step_unit_id,
};
use anvil_core::domain::failure::FailureDetail;
use anvil_core::domain::pipeline::PipelineDefinition;
use anvil_core::domain::state::{TransitionError, UnitKind, UnitState};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Addresses one unit of an execution by position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitRef {
    Pipeline,
    Stage(usize),
    Job(usize, usize),
    Step(usize, usize, usize),
}

impl UnitRef {
    pub fn kind(self) -> UnitKind {
        match self {
            Self::Pipeline => UnitKind::Pipeline,
            Self::Stage(_) => UnitKind::Stage,
            Self::Job(..) => UnitKind::Job,
            Self::Step(..) => UnitKind::Step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRun {
    pub state: UnitState,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub name: String,
    pub state: UnitState,
    pub steps: Vec<StepRun>,
}

#[derive(Debug, Clone)]
pub struct StageRun {
    pub name: String,
    pub state: UnitState,
    pub jobs: Vec<JobRun>,
}

/// Runtime state of one pipeline run
#[derive(Debug, Clone)]
pub struct Execution {
    id: Uuid,
    state: UnitState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stages: Vec<StageRun>,
    root_cause: Option<FailureDetail>,
    cancel_requested: bool,
    degraded_reporting: bool,
}

impl Execution {
    /// Creates an execution with every unit `PENDING`
    pub fn new(definition: &PipelineDefinition) -> Self {
        let stages = definition
            .stages
            .iter()
            .map(|stage| StageRun {
                name: stage.name.clone(),
                state: UnitState::Pending,
                jobs: stage
                    .jobs
                    .iter()
                    .map(|job| JobRun {
                        name: job.name.clone(),
                        state: UnitState::Pending,
                        steps: job
                            .steps
                            .iter()
                            .map(|_| StepRun {
                                state: UnitState::Pending,
                                exit_code: None,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            id: definition.execution_id,
            state: UnitState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stages,
            root_cause: None,
            cancel_requested: false,
            degraded_reporting: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// State of the pipeline itself
    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn stages(&self) -> &[StageRun] {
        &self.stages
    }

    /// First failure recorded in this execution
    pub fn root_cause(&self) -> Option<&FailureDetail> {
        self.root_cause.as_ref()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn degraded_reporting(&self) -> bool {
        self.degraded_reporting
    }

    pub fn mark_degraded_reporting(&mut self) {
        self.degraded_reporting = true;
    }

    pub fn state_of(&self, unit: UnitRef) -> UnitState {
        match unit {
            UnitRef::Pipeline => self.state,
            UnitRef::Stage(s) => self.stages[s].state,
            UnitRef::Job(s, j) => self.stages[s].jobs[j].state,
            UnitRef::Step(s, j, k) => self.stages[s].jobs[j].steps[k].state,
        }
    }

    /// Slash-separated identifier used on the wire
    pub fn unit_id(&self, unit: UnitRef) -> String {
        match unit {
            UnitRef::Pipeline => PIPELINE_UNIT_ID.to_string(),
            UnitRef::Stage(s) => stage_unit_id(&self.stages[s].name),
            UnitRef::Job(s, j) => job_unit_id(&self.stages[s].name, &self.stages[s].jobs[j].name),
            UnitRef::Step(s, j, k) => {
                step_unit_id(&self.stages[s].name, &self.stages[s].jobs[j].name, k)
            }
        }
    }

    pub fn record_exit_code(&mut self, stage: usize, job: usize, step: usize, code: Option<i32>) {
        self.stages[stage].jobs[job].steps[step].exit_code = code;
    }

    /// Moves a unit to `to`
    ///
    /// The first `FAILED` transition carrying a detail becomes the root cause
    /// of the execution.
    pub fn transition(
        &mut self,
        unit: UnitRef,
        to: UnitState,
        detail: Option<FailureDetail>,
    ) -> Result<StatusEvent, TransitionError> {
        let from = self.state_of(unit);
        let unit_id = self.unit_id(unit);

        if !from.can_transition_to(to) {
            return Err(TransitionError {
                kind: unit.kind(),
                unit_id,
                from,
                to,
            });
        }

        *self.state_mut(unit) = to;

        if unit == UnitRef::Pipeline {
            let now = Utc::now();
            if to == UnitState::Running {
                self.started_at = Some(now);
            }
            if to.is_terminal() {
                self.finished_at = Some(now);
            }
        }

        if to == UnitState::Failed && self.root_cause.is_none() {
            if let Some(detail) = &detail {
                self.root_cause = Some(detail.caused_by(&unit_id));
            }
        }

        Ok(StatusEvent::new(self.id, unit.kind(), unit_id, from, to, detail))
    }

    /// Cancels every `PENDING` step of a job, in step order
    pub fn cancel_pending_steps(&mut self, stage: usize, job: usize) -> Vec<StatusEvent> {
        let count = self.stages[stage].jobs[job].steps.len();
        (0..count)
            .filter_map(|k| self.cancel_if_pending(UnitRef::Step(stage, job, k)))
            .collect()
    }

    /// Cancels every `PENDING` unit of the given stage and all later stages
    ///
    /// Children are cancelled before their parent.
    pub fn cancel_pending_from(&mut self, first_stage: usize) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        for s in first_stage..self.stages.len() {
            for j in 0..self.stages[s].jobs.len() {
                events.extend(self.cancel_pending_steps(s, j));
                events.extend(self.cancel_if_pending(UnitRef::Job(s, j)));
            }
            events.extend(self.cancel_if_pending(UnitRef::Stage(s)));
        }
        events
    }

    fn cancel_if_pending(&mut self, unit: UnitRef) -> Option<StatusEvent> {
        if self.state_of(unit) != UnitState::Pending {
            return None;
        }
        self.transition(unit, UnitState::Cancelled, None).ok()
    }

    fn state_mut(&mut self, unit: UnitRef) -> &mut UnitState {
        match unit {
            UnitRef::Pipeline => &mut self.state,
            UnitRef::Stage(s) => &mut self.stages[s].state,
            UnitRef::Job(s, j) => &mut self.stages[s].jobs[j].state,
            UnitRef::Step(s, j, k) => &mut self.stages[s].jobs[j].steps[k].state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::domain::failure::FailureKind;

    fn definition() -> PipelineDefinition {
        PipelineDefinition::parse(
            r#"{
                "executionId": "6f1c2a4e-5b7d-4c1a-9e3f-2d8b7a6c5e4f",
                "repositoryUrl": "https://example.com/app.git",
                "revision": "main",
                "stages": [
                    {"name": "build", "jobs": [
                        {"name": "compile", "image": "rust", "steps": [{"command": "make"}, {"command": "make test"}]}
                    ]},
                    {"name": "deploy", "jobs": [
                        {"name": "push", "image": "alpine", "steps": [{"command": "./push.sh"}]}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_new_execution_is_all_pending() {
        let execution = Execution::new(&definition());
        assert_eq!(execution.state(), UnitState::Pending);
        assert!(execution.started_at().is_none());
        assert!(
            execution
                .stages()
                .iter()
                .flat_map(|s| &s.jobs)
                .flat_map(|j| &j.steps)
                .all(|s| s.state == UnitState::Pending)
        );
    }

    #[test]
    fn test_unit_ids() {
        let execution = Execution::new(&definition());
        assert_eq!(execution.unit_id(UnitRef::Pipeline), "pipeline");
        assert_eq!(execution.unit_id(UnitRef::Stage(1)), "deploy");
        assert_eq!(execution.unit_id(UnitRef::Job(0, 0)), "build/compile");
        assert_eq!(execution.unit_id(UnitRef::Step(0, 0, 1)), "build/compile/1");
    }

    #[test]
    fn test_transition_produces_event() {
        let mut execution = Execution::new(&definition());
        let event = execution
            .transition(UnitRef::Stage(0), UnitState::Running, None)
            .unwrap();

        assert_eq!(event.unit_kind, UnitKind::Stage);
        assert_eq!(event.unit_id, "build");
        assert_eq!(event.old_state, UnitState::Pending);
        assert_eq!(event.new_state, UnitState::Running);
        assert_eq!(execution.state_of(UnitRef::Stage(0)), UnitState::Running);
    }

    #[test]
    fn test_terminal_units_cannot_move() {
        let mut execution = Execution::new(&definition());
        let job = UnitRef::Job(0, 0);
        execution.transition(job, UnitState::Running, None).unwrap();
        execution.transition(job, UnitState::Succeeded, None).unwrap();

        let err = execution
            .transition(job, UnitState::Cancelled, None)
            .unwrap_err();
        assert_eq!(err.from, UnitState::Succeeded);
        assert_eq!(execution.state_of(job), UnitState::Succeeded);
    }

    #[test]
    fn test_first_failure_is_root_cause() {
        let mut execution = Execution::new(&definition());
        let step = UnitRef::Step(0, 0, 0);
        execution.transition(step, UnitState::Running, None).unwrap();
        execution
            .transition(
                step,
                UnitState::Failed,
                Some(FailureDetail::new(FailureKind::NonZeroExit, "exited with code 1")),
            )
            .unwrap();

        execution
            .transition(
                UnitRef::Job(1, 0),
                UnitState::Failed,
                Some(FailureDetail::new(FailureKind::WorkspaceError, "disk full")),
            )
            .unwrap();

        let root = execution.root_cause().unwrap();
        assert_eq!(root.kind, FailureKind::NonZeroExit);
        assert_eq!(root.root_unit.as_deref(), Some("build/compile/0"));
    }

    #[test]
    fn test_cancel_pending_from_orders_children_first() {
        let mut execution = Execution::new(&definition());
        let events = execution.cancel_pending_from(1);

        let ids: Vec<&str> = events.iter().map(|e| e.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["deploy/push/0", "deploy/push", "deploy"]);
        assert!(events.iter().all(|e| e.new_state == UnitState::Cancelled));
        assert_eq!(execution.state_of(UnitRef::Stage(0)), UnitState::Pending);
    }

    #[test]
    fn test_pipeline_timestamps() {
        let mut execution = Execution::new(&definition());
        execution
            .transition(UnitRef::Pipeline, UnitState::Running, None)
            .unwrap();
        assert!(execution.started_at().is_some());
        assert!(execution.finished_at().is_none());

        execution
            .transition(UnitRef::Pipeline, UnitState::Cancelled, None)
            .unwrap();
        assert!(execution.finished_at().is_some());
    }
}
