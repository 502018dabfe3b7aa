//! Core domain types
//!
//! This module contains the structures shared between the worker (which
//! executes pipelines) and the controlling service (which records progress).

pub mod artifact;
pub mod event;
pub mod failure;
pub mod log;
pub mod pipeline;
pub mod state;
