//! In-memory collaborators for engine and consumer tests

#![allow(dead_code)]

use anvil_client::ClientError;
use anvil_core::domain::artifact::ArtifactKey;
use anvil_core::domain::log::StepOutput;
use anvil_core::domain::pipeline::PipelineDefinition;
use anvil_core::domain::state::{UnitKind, UnitState};
use anvil_core::dto::execution::ClaimOutcome;
use anvil_core::dto::queue::QueueMessage;
use anvil_core::dto::status::StatusUpdate;
use anvil_worker::engine::{EngineConfig, ExecutionOutcome, PipelineEngine};
use anvil_worker::repository::{
    ArtifactError, ArtifactStore, ExecutionRepository, LogRepository, MessageQueue, StatusSink,
};
use anvil_worker::runtime::{
    CapturedOutput, ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError,
};
use anvil_worker::service::{FetchError, RepositoryFetcher, RetryPolicy, StatusReporter};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Container runtime
// =============================================================================

/// What a fake container does, decided by its command:
/// - `exit <code>` exits immediately
/// - `sleep <ms>` exits 0 after a delay
/// - `write <file>` creates the file in the workspace, exits 0
/// - `require <file>` exits 0 if the file exists in the workspace, else 1
/// - `link <file> <target>` creates a symlink to `target` in the workspace
/// - `hang` runs until terminated
/// - `nocreate` fails at creation
#[derive(Debug, Clone, PartialEq)]
enum Behaviour {
    Exit(i32),
    Sleep(u64),
    Write(String),
    Require(String),
    Link(String, String),
    Hang,
    CreateFails,
}

impl Behaviour {
    fn parse(command: &str) -> Self {
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
        match verb {
            "exit" => Self::Exit(arg.parse().unwrap()),
            "sleep" => Self::Sleep(arg.parse().unwrap()),
            "write" => Self::Write(arg.to_string()),
            "require" => Self::Require(arg.to_string()),
            "link" => {
                let (file, target) = arg.split_once(' ').unwrap();
                Self::Link(file.to_string(), target.to_string())
            }
            "hang" => Self::Hang,
            "nocreate" => Self::CreateFails,
            _ => Self::Exit(0),
        }
    }
}

struct FakeContainer {
    spec: ContainerSpec,
    behaviour: Behaviour,
    killed: Arc<Notify>,
}

/// One call made to the fake runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub op: &'static str,
    pub container: String,
    pub command: String,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    calls: Mutex<Vec<RuntimeCall>>,
    live: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, op: &'static str, container: &str) {
        let command = self
            .containers
            .lock()
            .unwrap()
            .get(container)
            .map(|c| c.spec.command.clone())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(RuntimeCall {
            op,
            container: container.to_string(),
            command,
        });
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands of all created containers, in creation order
    pub fn created_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == "create")
            .map(|c| c.command)
            .collect()
    }

    pub fn terminated_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == "terminate")
            .map(|c| c.command)
            .collect()
    }

    /// Containers created but never removed
    pub fn leaked(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let behaviour = Behaviour::parse(&spec.command);
        if behaviour == Behaviour::CreateFails {
            return Err(RuntimeError::Create(format!("image {} not found", spec.image)));
        }

        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                behaviour,
                killed: Arc::new(Notify::new()),
            },
        );
        self.live.lock().unwrap().insert(spec.name.clone());
        self.record("create", &spec.name);

        Ok(ContainerHandle {
            id: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record("start", &handle.id);
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle, timeout: Duration) -> Result<i32, RuntimeError> {
        let (behaviour, workspace, killed) = {
            let containers = self.containers.lock().unwrap();
            let c = &containers[&handle.id];
            (c.behaviour.clone(), c.spec.workspace.clone(), Arc::clone(&c.killed))
        };

        let run = async move {
            match behaviour {
                Behaviour::Exit(code) => code,
                Behaviour::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    0
                }
                Behaviour::Write(file) => {
                    std::fs::write(workspace.join(&file), format!("contents of {}", file)).unwrap();
                    0
                }
                Behaviour::Require(file) => {
                    if workspace.join(&file).exists() {
                        0
                    } else {
                        1
                    }
                }
                Behaviour::Link(file, target) => {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&target, workspace.join(&file)).unwrap();
                    0
                }
                Behaviour::Hang => {
                    killed.notified().await;
                    137
                }
                Behaviour::CreateFails => unreachable!(),
            }
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
        limit: usize,
    ) -> Result<CapturedOutput, RuntimeError> {
        let command = self.containers.lock().unwrap()[&handle.id].spec.command.clone();
        Ok(CapturedOutput::from_bytes(format!("$ {}\n", command).as_bytes(), limit))
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record("terminate", &handle.id);
        if let Some(c) = self.containers.lock().unwrap().get(&handle.id) {
            c.killed.notify_one();
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record("remove", &handle.id);
        self.live.lock().unwrap().remove(&handle.id);
        Ok(())
    }
}

// =============================================================================
// Fetcher
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum FetchMode {
    Ok,
    Fail,
    /// Never completes, like a remote that stops responding
    Hang,
}

pub struct FakeFetcher {
    mode: FetchMode,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    fn with_mode(mode: FetchMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::with_mode(FetchMode::Ok)
    }

    pub fn failing() -> Arc<Self> {
        Self::with_mode(FetchMode::Fail)
    }

    pub fn hanging() -> Arc<Self> {
        Self::with_mode(FetchMode::Hang)
    }
}

#[async_trait]
impl RepositoryFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FetchMode::Ok => {}
            FetchMode::Fail => {
                return Err(FetchError::SourceUnavailable(format!(
                    "revision {} not found in {}",
                    revision, url
                )));
            }
            FetchMode::Hang => std::future::pending::<()>().await,
        }

        std::fs::create_dir_all(dest).unwrap();
        std::fs::write(dest.join("README"), "source\n").unwrap();
        Ok(dest.to_path_buf())
    }
}

// =============================================================================
// Artifacts and logs
// =============================================================================

#[derive(Default)]
pub struct MemoryArtifactStore {
    fail: bool,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Vec<u8>) -> Result<(), ArtifactError> {
        if self.fail {
            return Err(ArtifactError::Client(ClientError::api_error(
                503,
                "object store unavailable",
            )));
        }
        self.objects.lock().unwrap().insert(key.object_key(), data);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError> {
        self.objects
            .lock()
            .unwrap()
            .get(&key.object_key())
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(key.object_key()))
    }
}

#[derive(Default)]
pub struct RecordingLogs {
    pub outputs: Mutex<Vec<StepOutput>>,
}

#[async_trait]
impl LogRepository for RecordingLogs {
    async fn send_step_output(&self, _execution_id: Uuid, output: StepOutput) -> anyhow::Result<()> {
        self.outputs.lock().unwrap().push(output);
        Ok(())
    }
}

// =============================================================================
// Status sink
// =============================================================================

/// Controller side of status delivery: deduplicates on event id and can be
/// told to fail the first attempts
#[derive(Default)]
pub struct RecordingSink {
    fail_first: AtomicUsize,
    always_fail: bool,
    attempts: AtomicUsize,
    seen: Mutex<HashSet<Uuid>>,
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first: AtomicUsize::new(n),
            ..Self::default()
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            always_fail: true,
            ..Self::default()
        })
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// States recorded for one unit, in delivery order
    pub fn states_of(&self, unit_id: &str) -> Vec<UnitState> {
        self.updates()
            .into_iter()
            .filter(|u| u.unit_id == unit_id)
            .map(|u| u.state)
            .collect()
    }

    /// Position of the first update matching unit and state
    pub fn position(&self, unit_id: &str, state: UnitState) -> Option<usize> {
        self.updates()
            .iter()
            .position(|u| u.unit_id == unit_id && u.state == state)
    }

    pub fn count(&self, kind: UnitKind, state: UnitState) -> usize {
        self.updates()
            .iter()
            .filter(|u| u.unit_kind == kind && u.state == state)
            .count()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn deliver(&self, update: &StatusUpdate) -> Result<(), ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.always_fail {
            return Err(ClientError::api_error(503, "controller unavailable"));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            // Record before failing, as if the response was lost in transit
            self.accept(update);
            return Err(ClientError::api_error(502, "bad gateway"));
        }

        self.accept(update);
        Ok(())
    }
}

impl RecordingSink {
    fn accept(&self, update: &StatusUpdate) {
        if self.seen.lock().unwrap().insert(update.event_id) {
            self.updates.lock().unwrap().push(update.clone());
        }
    }
}

// =============================================================================
// Queue and claims
// =============================================================================

/// Shared, ordered log of queue and claim operations
pub type OpLog = Arc<Mutex<Vec<String>>>;

pub struct MemoryQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    ops: OpLog,
}

impl MemoryQueue {
    pub fn new(ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            ops,
        })
    }

    pub fn push(&self, delivery_id: &str, body: impl Into<String>) {
        self.pending.lock().unwrap().push_back(QueueMessage {
            delivery_id: delivery_id.to_string(),
            body: body.into(),
        });
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self, max: usize) -> anyhow::Result<Vec<QueueMessage>> {
        let mut pending = self.pending.lock().unwrap();
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    async fn ack(&self, delivery_id: &str) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(format!("ack {}", delivery_id));
        Ok(())
    }

    async fn reject(&self, delivery_id: &str, requeue: bool) -> anyhow::Result<()> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("reject {} requeue={}", delivery_id, requeue));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeClaims {
    ops: OpLog,
    owned_elsewhere: Mutex<HashSet<Uuid>>,
    unavailable: bool,
    cancellations: Mutex<Vec<Uuid>>,
}

impl FakeClaims {
    pub fn new(ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            ops,
            ..Self::default()
        })
    }

    pub fn unavailable(ops: OpLog) -> Arc<Self> {
        Arc::new(Self {
            ops,
            unavailable: true,
            ..Self::default()
        })
    }

    pub fn owned_elsewhere(&self, execution_id: Uuid) {
        self.owned_elsewhere.lock().unwrap().insert(execution_id);
    }

    pub fn request_cancel(&self, execution_id: Uuid) {
        self.cancellations.lock().unwrap().push(execution_id);
    }
}

#[async_trait]
impl ExecutionRepository for FakeClaims {
    async fn claim(&self, execution_id: Uuid) -> anyhow::Result<ClaimOutcome> {
        if self.unavailable {
            anyhow::bail!("controller unavailable");
        }
        self.ops
            .lock()
            .unwrap()
            .push(format!("claim {}", execution_id));
        if self.owned_elsewhere.lock().unwrap().contains(&execution_id) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        Ok(ClaimOutcome::Claimed)
    }

    async fn pending_cancellations(&self) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.cancellations.lock().unwrap().drain(..).collect())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// Engine wired to in-memory collaborators
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub fetcher: Arc<FakeFetcher>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub logs: Arc<RecordingLogs>,
    pub sink: Arc<RecordingSink>,
    pub reporter: StatusReporter,
    pub engine: Arc<PipelineEngine>,
    pub workspace_base: tempfile::TempDir,
}

pub struct HarnessBuilder {
    fetcher: Arc<FakeFetcher>,
    artifacts: Arc<MemoryArtifactStore>,
    sink: Arc<RecordingSink>,
    step_timeout: Duration,
    fetch_timeout: Duration,
}

impl HarnessBuilder {
    pub fn fetcher(mut self, fetcher: Arc<FakeFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<MemoryArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn sink(mut self, sink: Arc<RecordingSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn build(self) -> Harness {
        let runtime = FakeRuntime::new();
        let logs = Arc::new(RecordingLogs::default());
        let workspace_base = tempfile::tempdir().unwrap();

        let engine = Arc::new(PipelineEngine::new(
            runtime.clone(),
            self.fetcher.clone(),
            self.artifacts.clone(),
            logs.clone(),
            EngineConfig {
                step_timeout: self.step_timeout,
                fetch_timeout: self.fetch_timeout,
                workspace_base: workspace_base.path().to_path_buf(),
                keep_workspaces: false,
                step_output_limit: 4096,
            },
        ));

        Harness {
            runtime,
            fetcher: self.fetcher,
            artifacts: self.artifacts,
            logs,
            reporter: StatusReporter::new(self.sink.clone(), fast_retry()),
            sink: self.sink,
            engine,
            workspace_base,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            fetcher: FakeFetcher::ok(),
            artifacts: MemoryArtifactStore::new(),
            sink: RecordingSink::new(),
            step_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn run(&self, definition: PipelineDefinition) -> ExecutionOutcome {
        self.run_with(definition, CancellationToken::new()).await
    }

    pub async fn run_with(
        &self,
        definition: PipelineDefinition,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let reporter = self.reporter.open(definition.execution_id);
        self.engine.run(definition, reporter, cancel).await
    }
}

// =============================================================================
// Pipeline builders
// =============================================================================

/// A job as `(name, commands)`
pub type JobSpec<'a> = (&'a str, &'a [&'a str]);

pub fn job_json(name: &str, commands: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "image": "alpine:3.20",
        "steps": commands.iter().map(|c| serde_json::json!({ "command": c })).collect::<Vec<_>>(),
    })
}

pub fn pipeline_json(stages: &[(&str, Vec<serde_json::Value>)]) -> serde_json::Value {
    serde_json::json!({
        "executionId": Uuid::new_v4(),
        "repositoryUrl": "https://git.example.com/team/app.git",
        "revision": "main",
        "stages": stages
            .iter()
            .map(|(name, jobs)| serde_json::json!({ "name": name, "jobs": jobs }))
            .collect::<Vec<_>>(),
    })
}

pub fn pipeline(stages: &[(&str, &[JobSpec<'_>])]) -> PipelineDefinition {
    let stages: Vec<(&str, Vec<serde_json::Value>)> = stages
        .iter()
        .map(|(name, jobs)| {
            (
                *name,
                jobs.iter().map(|(job, steps)| job_json(job, steps)).collect(),
            )
        })
        .collect();
    PipelineDefinition::parse(&pipeline_json(&stages).to_string()).unwrap()
}
