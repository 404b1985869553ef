//! Engine configuration types for weft.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! sets engine-wide scheduling defaults.

use serde::{Deserialize, Serialize};

use crate::workflow::SkipPolicy;

/// Engine-wide scheduling defaults.
///
/// Loaded from `~/.weft/config.toml`. All fields have sensible defaults,
/// and a workflow definition may override `fail_fast`, `max_parallelism`
/// and `skip_policy` for its own runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of concurrently running task attempts per run.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Halt the run on the first unrecoverable task failure.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// Treatment of dependents of skipped tasks.
    #[serde(default)]
    pub skip_policy: SkipPolicy,

    /// Attempt timeout applied to tasks that declare none.
    #[serde(default)]
    pub default_task_timeout_ms: Option<u64>,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_parallelism() -> usize {
    4
}

fn default_fail_fast() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            fail_fast: default_fail_fast(),
            skip_policy: SkipPolicy::default(),
            default_task_timeout_ms: None,
            event_capacity: default_event_capacity(),
        }
    }
}
