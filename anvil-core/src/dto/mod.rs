//! Data Transfer Objects for worker/controller communication
//!
//! This module contains the wire shapes exchanged between the worker and the
//! controlling service. Domain types that are already wire-ready (such as
//! `PipelineDefinition` and `StepOutput`) are sent as-is.

pub mod execution;
pub mod queue;
pub mod status;
