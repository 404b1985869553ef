//! Workflow engine core: definition loading, DAG scheduling, and run coordination.
//!
//! - `definition` -- YAML parsing, structural validation, filesystem load/save
//! - `dag` -- validated `Workflow`, cycle detection, reference checks, waves
//! - `expression` -- `when` conditions and `{{ }}` templates
//! - `store` -- per-run parameter and artifact bindings
//! - `retry` -- backoff computation and retry decisions
//! - `executor` -- executor and artifact transfer ports
//! - `checkpoint` -- persistence of run and task instance state
//! - `scheduler` -- per-run driver loop
//! - `coordinator` -- submit, status, cancel

pub mod checkpoint;
pub mod coordinator;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod scheduler;
pub mod store;
