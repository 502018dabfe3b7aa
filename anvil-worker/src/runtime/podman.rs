//! Podman / Docker CLI backend
//!
//! Drives the container engine binary directly:
//! - `create` with the job workspace mounted at `/workspace`
//! - `start`, `wait`, `logs` for the step's lifetime
//! - `kill` and `rm -f` for termination and cleanup
//!
//! Both engines accept the same arguments for everything used here.

use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    CapturedOutput, ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError,
    WORKSPACE_MOUNT,
};

/// Container engine binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    Podman,
    Docker,
}

impl ContainerEngine {
    pub fn binary(self) -> &'static str {
        match self {
            Self::Podman => "podman",
            Self::Docker => "docker",
        }
    }
}

impl FromStr for ContainerEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podman" => Ok(Self::Podman),
            "docker" => Ok(Self::Docker),
            other => anyhow::bail!("unsupported container engine '{}'", other),
        }
    }
}

/// Container runtime backed by the podman or docker CLI
#[derive(Debug, Clone)]
pub struct CliRuntime {
    engine: ContainerEngine,
}

impl CliRuntime {
    pub fn new(engine: ContainerEngine) -> Self {
        Self { engine }
    }

    /// Checks that the engine binary is installed and responding
    pub async fn check_available(&self) -> anyhow::Result<()> {
        let output = self
            .run(&["--version".to_string()])
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to execute '{} --version'. Is it installed? {}",
                    self.engine.binary(),
                    e
                )
            })?;

        if !output.status.success() {
            anyhow::bail!("{} is not working correctly", self.engine.binary());
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Container engine is available: {}", version.trim());

        Ok(())
    }

    async fn run(&self, args: &[String]) -> std::io::Result<Output> {
        debug!("{} {}", self.engine.binary(), args.join(" "));
        Command::new(self.engine.binary())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

/// Arguments for `create`, kept separate so they can be inspected in tests
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-v".to_string(),
        format!("{}:{}", spec.workspace.display(), WORKSPACE_MOUNT),
        "-w".to_string(),
        spec.container_workdir(),
        // Override any image entrypoint so every step is a plain shell command
        "--entrypoint".to_string(),
        "/bin/sh".to_string(),
    ];

    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.push("-c".to_string());
    args.push(spec.command.clone());
    args
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status.code().unwrap_or(-1))
    } else {
        stderr
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        tokio::fs::create_dir_all(&spec.workspace).await?;

        let output = self.run(&create_args(spec)).await?;
        if !output.status.success() {
            return Err(RuntimeError::Create(format!(
                "image {}: {}",
                spec.image,
                stderr_of(&output)
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Created container {} ({})", spec.name, id);

        Ok(ContainerHandle { id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let output = self
            .run(&["start".to_string(), handle.id.clone()])
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Start(stderr_of(&output)));
        }
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle, timeout: Duration) -> Result<i32, RuntimeError> {
        let args = ["wait".to_string(), handle.id.clone()];
        let output = tokio::time::timeout(timeout, self.run(&args))
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(RuntimeError::Runtime(stderr_of(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<i32>().ok())
            .ok_or_else(|| {
                RuntimeError::Runtime(format!("unexpected wait output: '{}'", stdout.trim()))
            })
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
        limit: usize,
    ) -> Result<CapturedOutput, RuntimeError> {
        debug!("{} logs {}", self.engine.binary(), handle.id);
        let mut child = Command::new(self.engine.binary())
            .args(["logs", handle.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RuntimeError::Runtime("logs output was not captured".to_string()));
        };

        // The engine replays container stderr on its own stderr; both pipes
        // are drained together
        let (mut combined, stderr) = tokio::try_join!(
            CapturedOutput::read_from(stdout, limit),
            CapturedOutput::read_from(stderr, limit),
        )?;

        let status = child.wait().await?;
        if !status.success() {
            let message = stderr.to_text().trim().to_string();
            return Err(RuntimeError::Runtime(if message.is_empty() {
                format!("exit status {}", status.code().unwrap_or(-1))
            } else {
                message
            }));
        }

        combined.append(stderr);
        Ok(combined)
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let output = self.run(&["kill".to_string(), handle.id.clone()]).await?;
        if !output.status.success() {
            return Err(RuntimeError::Runtime(stderr_of(&output)));
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let output = self
            .run(&["rm".to_string(), "-f".to_string(), handle.id.clone()])
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Runtime(stderr_of(&output)));
        }
        debug!("Container {} removed", handle.id);
        Ok(())
    }
}
