//! Artifact store
//!
//! Artifacts are opaque byte blobs stored under
//! `{executionId}/{jobName}/{artifactName}`. Two backends exist:
//! - the controlling service over HTTP
//! - a local directory, for single-host setups

use anvil_client::{ClientError, ControllerClient};
use anvil_core::domain::artifact::ArtifactKey;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Repository trait for artifact storage
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores an artifact, replacing any previous content under the key
    ///
    /// # Arguments
    /// * `key` - Execution, job, and artifact name
    /// * `data` - Artifact content
    async fn put(&self, key: &ArtifactKey, data: Vec<u8>) -> Result<(), ArtifactError>;

    /// Retrieves a stored artifact
    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError>;
}

/// HTTP implementation of ArtifactStore
pub struct HttpArtifactStore {
    client: ControllerClient,
}

impl HttpArtifactStore {
    pub fn new(client: ControllerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Vec<u8>) -> Result<(), ArtifactError> {
        debug!("Uploading artifact {} ({} bytes)", key, data.len());
        self.client.put_artifact(key, data).await?;
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError> {
        match self.client.get_artifact(key).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => Err(ArtifactError::NotFound(key.object_key())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Filesystem implementation of ArtifactStore
///
/// Objects live at `<root>/{executionId}/{jobName}/{artifactName}`.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the on-disk path of a key, refusing keys that escape the root
    pub fn path_of(&self, key: &ArtifactKey) -> Result<PathBuf, ArtifactError> {
        let relative = key.object_key();
        let escapes = Path::new(&relative)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(ArtifactError::InvalidKey(relative));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &ArtifactKey, data: Vec<u8>) -> Result<(), ArtifactError> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial object; every
        // write stages under its own hidden name
        let file_name = path
            .file_name()
            .ok_or_else(|| ArtifactError::InvalidKey(key.object_key()))?;
        let mut staging = std::ffi::OsString::from(".");
        staging.push(file_name);
        staging.push(format!(".{}.partial", Uuid::new_v4().simple()));
        let partial = path.with_file_name(staging);
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, &path).await?;

        debug!("Stored artifact {} at {}", key, path.display());
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.object_key()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
