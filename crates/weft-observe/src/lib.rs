//! Observability for weft: tracing subscriber setup and a logger for the
//! engine event bus.

pub mod notifier;
pub mod tracing_setup;
