//! Artifact endpoints

use crate::ControllerClient;
use crate::error::Result;
use anvil_core::domain::artifact::ArtifactKey;

impl ControllerClient {
    // =============================================================================
    // Artifacts
    // =============================================================================

    /// Store an artifact under `{executionId}/{jobName}/{artifactName}`
    pub async fn put_artifact(&self, key: &ArtifactKey, data: Vec<u8>) -> Result<()> {
        let url = self.artifact_url(key);
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Fetch a previously stored artifact
    pub async fn get_artifact(&self, key: &ArtifactKey) -> Result<Vec<u8>> {
        let url = self.artifact_url(key);
        let response = self.client.get(&url).send().await?;

        self.handle_bytes(response).await
    }

    fn artifact_url(&self, key: &ArtifactKey) -> String {
        format!("{}/api/artifacts/{}", self.base_url, key.object_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_artifact_url() {
        let client = ControllerClient::new("http://controller:8080/");
        let id = Uuid::parse_str("6f1c2a4e-5b7d-4c1a-9e3f-2d8b7a6c5e4f").unwrap();
        let key = ArtifactKey::new(id, "package", "dist/app.tar.gz");

        assert_eq!(
            client.artifact_url(&key),
            "http://controller:8080/api/artifacts/6f1c2a4e-5b7d-4c1a-9e3f-2d8b7a6c5e4f/package/dist/app.tar.gz"
        );
    }
}
