//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weft-infra) implements. The core crate never depends on any specific
//! storage technology; `MemoryRunRepository` is provided for embedding and
//! tests.

pub mod run;

pub use run::{MemoryRunRepository, RunRepository};
