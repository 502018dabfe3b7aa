//! Anvil Core
//!
//! Core types and abstractions for the Anvil build worker.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, unit states, status events, artifacts
//! - DTOs: wire representations exchanged with the controlling service

pub mod domain;
pub mod dto;
