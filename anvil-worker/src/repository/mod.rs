//! Repository layer
//!
//! Repositories are thin, stateless adapters over the controlling service
//! (and, for artifacts, optionally the local filesystem). They carry no
//! scheduling logic.
//!
//! All repositories are trait-based so the engine and consumer can be
//! driven by in-memory fakes in tests.

mod artifacts;
mod executions;
mod logs;
mod queue;
mod status;

// Re-export traits
pub use artifacts::{ArtifactError, ArtifactStore};
pub use executions::ExecutionRepository;
pub use logs::LogRepository;
pub use queue::MessageQueue;
pub use status::StatusSink;

// Re-export implementations
pub use artifacts::{HttpArtifactStore, LocalArtifactStore};
pub use executions::HttpExecutionRepository;
pub use logs::HttpLogRepository;
pub use queue::HttpMessageQueue;
pub use status::HttpStatusSink;
