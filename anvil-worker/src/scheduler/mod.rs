//! Scheduler layer for the worker
//!
//! Receives pipeline messages from the queue, claims them, and runs each
//! accepted pipeline in its own task, bounded by the worker's capacity.

pub mod consumer;
pub mod registry;

pub use consumer::{ConsumerConfig, Disposition, QueueConsumer};
pub use registry::ExecutionRegistry;
