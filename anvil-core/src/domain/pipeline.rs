//! Pipeline domain types
//!
//! A pipeline is a fixed two-level hierarchy: ordered stages, each holding a
//! set of jobs that run in parallel, each job holding ordered steps. The
//! definition doubles as the inbound queue message body.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use thiserror::Error;
use uuid::Uuid;

/// Pipeline execution request
///
/// Immutable once accepted; the engine owns it for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub execution_id: Uuid,
    pub repository_url: String,
    pub revision: String,
    pub stages: Vec<StageDefinition>,
}

/// A set of jobs that run concurrently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub name: String,
    pub jobs: Vec<JobDefinition>,
}

/// An ordered sequence of steps sharing one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub name: String,
    /// Container image every step of this job runs in
    pub image: String,
    pub steps: Vec<StepDefinition>,
    /// Workspace-relative paths persisted once the job succeeds
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Environment shared by every step (step env wins on conflict)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory relative to the workspace root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Per-step time budget overriding the worker default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// One containerized command invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Shell command line, run with `/bin/sh -c`
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Malformed pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed pipeline message: {0}")]
    Malformed(String),

    #[error("repository url must not be empty")]
    EmptyRepositoryUrl,

    #[error("revision must not be empty")]
    EmptyRevision,

    #[error("invalid revision '{0}'")]
    InvalidRevision(String),

    #[error("pipeline must declare at least one stage")]
    NoStages,

    #[error("stage #{0} has an empty name")]
    EmptyStageName(usize),

    #[error("invalid stage name '{0}'")]
    InvalidStageName(String),

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{0}' declares no jobs")]
    NoJobs(String),

    #[error("invalid job name '{job}' in stage '{stage}'")]
    InvalidJobName { stage: String, job: String },

    #[error("duplicate job name '{job}' in stage '{stage}'")]
    DuplicateJob { stage: String, job: String },

    #[error("job '{0}' has no image")]
    EmptyImage(String),

    #[error("job '{0}' declares no steps")]
    NoSteps(String),

    #[error("step {index} of job '{job}' has an empty command")]
    EmptyCommand { job: String, index: usize },

    #[error("invalid artifact path '{artifact}' in job '{job}'")]
    InvalidArtifact { job: String, artifact: String },

    #[error("invalid working directory '{dir}' in job '{job}'")]
    InvalidWorkingDir { job: String, dir: String },
}

impl PipelineDefinition {
    /// Parses and validates a raw queue message body
    pub fn parse(body: &str) -> Result<Self, ValidationError> {
        let definition: PipelineDefinition =
            serde_json::from_str(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Best-effort extraction of the execution id from a message that failed
    /// to parse, so the rejection can still be reported against it
    pub fn peek_execution_id(body: &str) -> Option<Uuid> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        value
            .get("executionId")?
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Checks structural rules the engine relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.repository_url.trim().is_empty() {
            return Err(ValidationError::EmptyRepositoryUrl);
        }
        if self.revision.trim().is_empty() {
            return Err(ValidationError::EmptyRevision);
        }
        if !is_valid_revision(&self.revision) {
            return Err(ValidationError::InvalidRevision(self.revision.clone()));
        }
        if self.stages.is_empty() {
            return Err(ValidationError::NoStages);
        }

        let mut stage_names = HashSet::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(ValidationError::EmptyStageName(idx));
            }
            if !is_valid_segment(&stage.name) {
                return Err(ValidationError::InvalidStageName(stage.name.clone()));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ValidationError::DuplicateStage(stage.name.clone()));
            }
            stage.validate()?;
        }

        Ok(())
    }

    /// Total number of jobs across all stages
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }
}

impl StageDefinition {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.jobs.is_empty() {
            return Err(ValidationError::NoJobs(self.name.clone()));
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if !is_valid_segment(&job.name) {
                return Err(ValidationError::InvalidJobName {
                    stage: self.name.clone(),
                    job: job.name.clone(),
                });
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(ValidationError::DuplicateJob {
                    stage: self.name.clone(),
                    job: job.name.clone(),
                });
            }
            job.validate()?;
        }

        Ok(())
    }
}

impl JobDefinition {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::EmptyImage(self.name.clone()));
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps(self.name.clone()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.command.trim().is_empty() {
                return Err(ValidationError::EmptyCommand {
                    job: self.name.clone(),
                    index,
                });
            }
        }

        for artifact in &self.artifacts {
            if !is_relative_inside(artifact) {
                return Err(ValidationError::InvalidArtifact {
                    job: self.name.clone(),
                    artifact: artifact.clone(),
                });
            }
        }

        if let Some(dir) = &self.working_dir {
            if !is_relative_inside(dir) {
                return Err(ValidationError::InvalidWorkingDir {
                    job: self.name.clone(),
                    dir: dir.clone(),
                });
            }
        }

        Ok(())
    }

    /// Merged environment for one step, step values taking precedence
    pub fn step_env(&self, step: &StepDefinition) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Stage and job names end up in object keys and directory names
fn is_valid_segment(name: &str) -> bool {
    !name.trim().is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Revisions are handed to git; they must never read as an option
fn is_valid_revision(revision: &str) -> bool {
    !revision.starts_with('-')
        && !revision
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
}

/// Relative path that cannot escape its base directory
fn is_relative_inside(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            image: "docker.io/alpine:3.20".to_string(),
            steps: vec![StepDefinition {
                command: "make test".to_string(),
                env: HashMap::new(),
            }],
            artifacts: vec![],
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: None,
        }
    }

    fn pipeline(stages: Vec<StageDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            execution_id: Uuid::new_v4(),
            repository_url: "https://example.com/repo.git".to_string(),
            revision: "main".to_string(),
            stages,
        }
    }

    #[test]
    fn test_parse_queue_message() {
        let body = r#"{
            "executionId": "6f1c2a4e-5b7d-4c1a-9e3f-2d8b7a6c5e4f",
            "repositoryUrl": "https://example.com/repo.git",
            "revision": "3f2a1b9",
            "stages": [{
                "name": "build",
                "jobs": [{
                    "name": "compile",
                    "image": "rust:1.85",
                    "steps": [{ "command": "cargo build", "env": { "CI": "1" } }],
                    "artifacts": ["target/release/app"]
                }]
            }]
        }"#;

        let def = PipelineDefinition::parse(body).unwrap();
        assert_eq!(def.stages.len(), 1);
        assert_eq!(def.stages[0].jobs[0].steps[0].env["CI"], "1");
        assert_eq!(def.stages[0].jobs[0].artifacts, vec!["target/release/app"]);
        assert_eq!(def.job_count(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = PipelineDefinition::parse("not json").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_peek_execution_id() {
        let body = r#"{"executionId": "6f1c2a4e-5b7d-4c1a-9e3f-2d8b7a6c5e4f", "stages": 3}"#;
        assert!(PipelineDefinition::peek_execution_id(body).is_some());
        assert!(PipelineDefinition::peek_execution_id("{}").is_none());
    }

    #[test]
    fn test_validate_requires_stages() {
        assert_eq!(pipeline(vec![]).validate(), Err(ValidationError::NoStages));
    }

    #[test]
    fn test_validate_duplicate_job_names() {
        let def = pipeline(vec![StageDefinition {
            name: "test".to_string(),
            jobs: vec![job("unit"), job("unit")],
        }]);

        assert!(matches!(
            def.validate(),
            Err(ValidationError::DuplicateJob { .. })
        ));
    }

    #[test]
    fn test_same_job_name_in_different_stages_is_allowed() {
        let def = pipeline(vec![
            StageDefinition {
                name: "build".to_string(),
                jobs: vec![job("linux")],
            },
            StageDefinition {
                name: "test".to_string(),
                jobs: vec![job("linux")],
            },
        ]);

        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_command() {
        let mut j = job("lint");
        j.steps.push(StepDefinition {
            command: "   ".to_string(),
            env: HashMap::new(),
        });
        let def = pipeline(vec![StageDefinition {
            name: "check".to_string(),
            jobs: vec![j],
        }]);

        assert_eq!(
            def.validate(),
            Err(ValidationError::EmptyCommand {
                job: "lint".to_string(),
                index: 1
            })
        );
    }

    #[test]
    fn test_validate_artifact_paths() {
        let mut j = job("package");
        j.artifacts = vec!["../outside".to_string()];
        let def = pipeline(vec![StageDefinition {
            name: "release".to_string(),
            jobs: vec![j],
        }]);

        assert!(matches!(
            def.validate(),
            Err(ValidationError::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_validate_job_name_cannot_contain_slash() {
        let def = pipeline(vec![StageDefinition {
            name: "build".to_string(),
            jobs: vec![job("a/b")],
        }]);

        assert!(matches!(
            def.validate(),
            Err(ValidationError::InvalidJobName { .. })
        ));
    }

    #[test]
    fn test_validate_stage_name_must_be_a_plain_segment() {
        for name in ["/tmp/victim", "..", "build/../..", "a\\b"] {
            let def = pipeline(vec![StageDefinition {
                name: name.to_string(),
                jobs: vec![job("compile")],
            }]);

            assert_eq!(
                def.validate(),
                Err(ValidationError::InvalidStageName(name.to_string())),
                "stage name {:?} was accepted",
                name
            );
        }
    }

    #[test]
    fn test_validate_rejects_option_like_revisions() {
        for revision in [
            "--upload-pack=touch /tmp/pwned;git-upload-pack",
            "-b",
            "main branch",
            "main\n",
        ] {
            let mut def = pipeline(vec![StageDefinition {
                name: "build".to_string(),
                jobs: vec![job("compile")],
            }]);
            def.revision = revision.to_string();

            assert!(
                matches!(def.validate(), Err(ValidationError::InvalidRevision(_))),
                "revision {:?} was accepted",
                revision
            );
        }
    }

    #[test]
    fn test_validate_accepts_common_revisions() {
        for revision in ["main", "v1.2.3", "release/2024-10", "3f2a1b9c0d"] {
            let mut def = pipeline(vec![StageDefinition {
                name: "build".to_string(),
                jobs: vec![job("compile")],
            }]);
            def.revision = revision.to_string();

            assert!(def.validate().is_ok(), "revision {:?} was rejected", revision);
        }
    }

    #[test]
    fn test_step_env_overrides_job_env() {
        let mut j = job("env");
        j.env.insert("MODE".to_string(), "debug".to_string());
        j.env.insert("SHARED".to_string(), "yes".to_string());
        let step = StepDefinition {
            command: "env".to_string(),
            env: HashMap::from([("MODE".to_string(), "release".to_string())]),
        };

        let env = j.step_env(&step);
        assert_eq!(env["MODE"], "release");
        assert_eq!(env["SHARED"], "yes");
    }
}
