//! Shared domain types for weft.
//!
//! This crate contains the data model used across the engine: workflow
//! definitions, task templates, run and task-instance records, engine events,
//! configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
