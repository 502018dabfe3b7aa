//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling
//! intervals, execution capacity, timeouts, reporting retries and the
//! controlling service connection.

use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::podman::ContainerEngine;

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Controlling service base URL (e.g., "http://localhost:8080")
    pub controller_url: String,

    /// How often to poll the queue for new pipeline messages
    pub poll_interval: Duration,

    /// How often to ask the controller which executions to cancel
    pub cancel_poll_interval: Duration,

    /// Max pipeline executions running at once on this worker
    pub max_concurrent_executions: usize,

    /// Default time budget of a single step
    pub step_timeout: Duration,

    /// Time budget for fetching the repository
    pub fetch_timeout: Duration,

    /// Directory under which execution workspaces are created
    pub workspace_base: PathBuf,

    /// Keep workspaces on disk after an execution finishes
    pub keep_workspaces: bool,

    /// Container engine binary used to run steps
    pub container_engine: ContainerEngine,

    /// When set, artifacts are stored below this directory instead of
    /// being uploaded to the controller
    pub artifact_dir: Option<PathBuf>,

    /// Delivery attempts per status event before reporting degrades
    pub report_max_attempts: u32,

    /// Backoff before the second delivery attempt
    pub report_initial_backoff: Duration,

    /// Upper bound for the exponential backoff
    pub report_max_backoff: Duration,

    /// Bytes of output kept per step
    pub step_output_limit: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, controller_url: String) -> Self {
        Self {
            worker_id,
            controller_url,
            poll_interval: Duration::from_secs(5),
            cancel_poll_interval: Duration::from_secs(10),
            max_concurrent_executions: 2,
            step_timeout: Duration::from_secs(1800), // 30 minutes
            fetch_timeout: Duration::from_secs(300),
            workspace_base: std::env::temp_dir().join("anvil"),
            keep_workspaces: false,
            container_engine: ContainerEngine::Podman,
            artifact_dir: None,
            report_max_attempts: 5,
            report_initial_backoff: Duration::from_millis(200),
            report_max_backoff: Duration::from_secs(10),
            step_output_limit: 64 * 1024,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (required)
    /// - CONTROLLER_URL (required)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - CANCEL_POLL_INTERVAL (optional, seconds, default: 10)
    /// - MAX_CONCURRENT_EXECUTIONS (optional, default: 2)
    /// - STEP_TIMEOUT (optional, seconds, default: 1800)
    /// - FETCH_TIMEOUT (optional, seconds, default: 300)
    /// - WORKSPACE_BASE (optional, default: $TMPDIR/anvil)
    /// - KEEP_WORKSPACES (optional, "true"/"1", default: false)
    /// - CONTAINER_ENGINE (optional, "podman" or "docker", default: podman)
    /// - ARTIFACT_DIR (optional, default: upload to controller)
    /// - REPORT_MAX_ATTEMPTS (optional, default: 5)
    /// - REPORT_INITIAL_BACKOFF_MS (optional, default: 200)
    /// - REPORT_MAX_BACKOFF_MS (optional, default: 10000)
    /// - STEP_OUTPUT_LIMIT (optional, bytes, default: 65536)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .map_err(|_| anyhow::anyhow!("WORKER_ID environment variable not set"))?;

        let controller_url = std::env::var("CONTROLLER_URL")
            .map_err(|_| anyhow::anyhow!("CONTROLLER_URL environment variable not set"))?;

        let mut config = Self::new(worker_id, controller_url);

        if let Some(secs) = env_parse::<u64>("POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CANCEL_POLL_INTERVAL") {
            config.cancel_poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("MAX_CONCURRENT_EXECUTIONS") {
            config.max_concurrent_executions = n;
        }
        if let Some(secs) = env_parse::<u64>("STEP_TIMEOUT") {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("FETCH_TIMEOUT") {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Ok(base) = std::env::var("WORKSPACE_BASE") {
            config.workspace_base = PathBuf::from(base);
        }
        if let Ok(keep) = std::env::var("KEEP_WORKSPACES") {
            config.keep_workspaces = matches!(keep.as_str(), "1" | "true" | "yes");
        }
        if let Ok(engine) = std::env::var("CONTAINER_ENGINE") {
            config.container_engine = engine.parse()?;
        }
        if let Ok(dir) = std::env::var("ARTIFACT_DIR") {
            config.artifact_dir = Some(PathBuf::from(dir));
        }
        if let Some(n) = env_parse::<u32>("REPORT_MAX_ATTEMPTS") {
            config.report_max_attempts = n;
        }
        if let Some(ms) = env_parse::<u64>("REPORT_INITIAL_BACKOFF_MS") {
            config.report_initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("REPORT_MAX_BACKOFF_MS") {
            config.report_max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("STEP_OUTPUT_LIMIT") {
            config.step_output_limit = n;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.controller_url.is_empty() {
            anyhow::bail!("controller_url cannot be empty");
        }

        if !self.controller_url.starts_with("http://")
            && !self.controller_url.starts_with("https://")
        {
            anyhow::bail!("controller_url must start with http:// or https://");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.cancel_poll_interval.is_zero() {
            anyhow::bail!("cancel_poll_interval must be greater than 0");
        }

        if self.max_concurrent_executions == 0 {
            anyhow::bail!("max_concurrent_executions must be greater than 0");
        }

        if self.step_timeout.is_zero() || self.fetch_timeout.is_zero() {
            anyhow::bail!("timeouts must be greater than 0");
        }

        if self.report_max_attempts == 0 {
            anyhow::bail!("report_max_attempts must be greater than 0");
        }

        if self.report_initial_backoff > self.report_max_backoff {
            anyhow::bail!("report_initial_backoff cannot exceed report_max_backoff");
        }

        if self.step_output_limit == 0 {
            anyhow::bail!("step_output_limit must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}
