//! Repository fetcher
//!
//! Materializes one source revision on local disk. Runs once per execution,
//! before any stage is dispatched.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote is unreachable or the revision does not resolve
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Service trait for fetching sources
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Fetches `revision` of `url` into `dest`
    ///
    /// # Arguments
    /// * `url` - Remote repository URL
    /// * `revision` - Branch, tag, or commit SHA
    /// * `dest` - Directory to create; must not exist yet
    ///
    /// # Returns
    /// The path of the checked out workspace
    async fn fetch(&self, url: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError>;
}

/// Fetcher backed by the `git` command line
#[derive(Debug, Clone, Default)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<(), FetchError> {
        debug!("git {}", args.join(" "));
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| FetchError::SourceUnavailable(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::SourceUnavailable(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn fetch(&self, url: &str, revision: &str, dest: &Path) -> Result<PathBuf, FetchError> {
        if revision.starts_with('-') {
            return Err(FetchError::SourceUnavailable(format!(
                "refusing revision '{}'",
                revision
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FetchError::SourceUnavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let dest_str = dest.to_string_lossy();
        self.git(&["clone", "--quiet", "--", url, &*dest_str], None)
            .await?;

        // Branches and tags resolve after a plain clone; a SHA outside the
        // default refs needs an explicit fetch first
        let checkout = self
            .git(
                &["checkout", "--quiet", "--end-of-options", revision, "--"],
                Some(dest),
            )
            .await;
        if checkout.is_err() {
            debug!("Revision {} not in clone, fetching it", revision);
            self.git(
                &["fetch", "--quiet", "--end-of-options", "origin", revision],
                Some(dest),
            )
            .await?;
            self.git(&["checkout", "--quiet", "--detach", "FETCH_HEAD"], Some(dest))
                .await?;
        }

        info!("Fetched {}@{} into {}", url, revision, dest.display());
        Ok(dest.to_path_buf())
    }
}
