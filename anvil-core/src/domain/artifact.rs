//! Artifact domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one stored artifact
///
/// The object key is `{executionId}/{jobName}/{artifactName}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactKey {
    pub execution_id: Uuid,
    pub job_name: String,
    pub artifact_name: String,
}

impl ArtifactKey {
    pub fn new(
        execution_id: Uuid,
        job_name: impl Into<String>,
        artifact_name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            job_name: job_name.into(),
            artifact_name: artifact_name.into(),
        }
    }

    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.execution_id, self.job_name, self.artifact_name
        )
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_key())
    }
}
