//! Service layer
//!
//! Services hold the worker's business logic around the repositories:
//! fetching sources, preparing workspaces and delivering status events.

mod reporter;
mod source;
mod workspace;

// Re-export traits
pub use source::RepositoryFetcher;

// Re-export implementations
pub use reporter::{DeliverySummary, ExecutionReporter, RetryPolicy, StatusReporter};
pub use source::{FetchError, GitFetcher};
pub use workspace::ExecutionWorkspace;
