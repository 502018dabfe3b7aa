//! Execution workspaces
//!
//! Layout under the configured base directory:
//!
//! ```text
//! <base>/<executionId>/source                 fetched once
//! <base>/<executionId>/jobs/<stage>/<job>     private copy per job
//! ```
//!
//! Steps of one job share its copy; parallel jobs never share files.

use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Directories belonging to one execution
#[derive(Debug, Clone)]
pub struct ExecutionWorkspace {
    root: PathBuf,
    source: PathBuf,
}

impl ExecutionWorkspace {
    pub fn new(base: &Path, execution_id: Uuid) -> Self {
        let root = base.join(execution_id.to_string());
        Self {
            source: root.join("source"),
            root,
        }
    }

    /// Uses `source` as the tree job workspaces are copied from
    pub fn with_source(mut self, source: PathBuf) -> Self {
        self.source = source;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the repository is fetched to
    pub fn source_dir(&self) -> &Path {
        &self.source
    }

    /// Job workspace path; each name must be a single plain path component
    pub fn job_dir(&self, stage: &str, job: &str) -> io::Result<PathBuf> {
        Ok(self
            .root
            .join("jobs")
            .join(single_component(stage)?)
            .join(single_component(job)?))
    }

    /// Creates the job's private workspace as a copy of the source
    pub async fn prepare_job(&self, stage: &str, job: &str) -> io::Result<PathBuf> {
        let source = self.source.clone();
        let target = self.job_dir(stage, job)?;

        let dest = target.clone();
        tokio::task::spawn_blocking(move || {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            copy_tree(&source, &dest)
        })
        .await
        .map_err(io::Error::other)??;

        debug!("Prepared workspace {}", target.display());
        Ok(target)
    }

    /// Removes everything belonging to the execution
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("Removed workspace {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.root.display(), e),
        }
    }
}

fn single_component(name: &str) -> io::Result<&Path> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(path),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' is not a plain directory name", name),
        )),
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());

        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let link = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(link, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}
