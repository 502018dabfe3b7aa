//! Anvil Worker
//!
//! A build worker that pulls pipeline executions from a queue and runs their
//! steps in disposable containers.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Runtime: Container backends and the step execution loop
//! - Repositories: Queue, executions, status, logs and artifact storage
//! - Services: Source fetching, workspaces and status reporting
//! - Engine: Stage/job/step scheduling and the execution state machine
//! - Scheduler: Queue consumption and the registry of running executions

pub mod config;
pub mod engine;
pub mod repository;
pub mod runtime;
pub mod scheduler;
pub mod service;
