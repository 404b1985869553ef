//! Per-run parameter and artifact store.
//!
//! Holds the run's effective global parameters and the outputs bound by each
//! task's current attempt. Bindings are write-once per attempt; starting a
//! new attempt clears whatever the previous attempt bound. Artifacts are
//! stored as `ArtifactRef` pointers only -- the bytes never enter the engine.
//!
//! The store is owned by the run's driver task, so it needs no locking.
//! Expression evaluation sees it through an immutable `VariableContext`.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use weft_types::workflow::StoredValue;

use super::expression::{VarPath, VariableContext};

/// Maximum serialized size of an inline parameter value (1 MB).
///
/// Anything larger must be passed as an artifact.
pub const MAX_PARAMETER_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    #[error("output '{output}' of task '{task}' already bound in attempt {attempt}")]
    DuplicateOutput {
        task: String,
        output: String,
        attempt: u32,
    },

    #[error("output '{output}' of task '{task}' is {size} bytes (limit {limit})")]
    OutputTooLarge {
        task: String,
        output: String,
        size: usize,
        limit: usize,
    },
}

// ---------------------------------------------------------------------------
// ParameterStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AttemptBindings {
    attempt: u32,
    values: BTreeMap<String, StoredValue>,
}

/// Bindings for a single run, keyed by `(task, output)` plus globals.
#[derive(Debug, Default)]
pub struct ParameterStore {
    globals: BTreeMap<String, Value>,
    outputs: HashMap<String, AttemptBindings>,
}

impl ParameterStore {
    /// Create a store seeded with the run's effective global parameters.
    pub fn new(globals: BTreeMap<String, Value>) -> Self {
        Self {
            globals,
            outputs: HashMap::new(),
        }
    }

    /// Start a new attempt for `task`, discarding any earlier bindings.
    pub fn begin_attempt(&mut self, task: &str, attempt: u32) {
        self.outputs.insert(
            task.to_string(),
            AttemptBindings {
                attempt,
                values: BTreeMap::new(),
            },
        );
    }

    /// Bind one output of `task`'s current attempt.
    pub fn bind(&mut self, task: &str, output: &str, value: StoredValue) -> Result<(), StoreError> {
        if let StoredValue::Parameter(v) = &value {
            let size = serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0);
            if size > MAX_PARAMETER_BYTES {
                return Err(StoreError::OutputTooLarge {
                    task: task.to_string(),
                    output: output.to_string(),
                    size,
                    limit: MAX_PARAMETER_BYTES,
                });
            }
        }

        let bindings = self.outputs.entry(task.to_string()).or_default();
        if bindings.values.contains_key(output) {
            return Err(StoreError::DuplicateOutput {
                task: task.to_string(),
                output: output.to_string(),
                attempt: bindings.attempt,
            });
        }
        bindings.values.insert(output.to_string(), value);
        Ok(())
    }

    /// Resolve a reference to its bound value.
    pub fn resolve(&self, path: &VarPath) -> Result<StoredValue, StoreError> {
        let found = match path {
            VarPath::Param(name) => self.globals.get(name).cloned().map(StoredValue::Parameter),
            VarPath::TaskOutput { task, output } => self
                .outputs
                .get(task)
                .and_then(|b| b.values.get(output))
                .cloned(),
        };
        found.ok_or_else(|| StoreError::UnresolvedReference(path.to_string()))
    }

    /// Everything `task`'s current attempt has bound.
    pub fn outputs_of(&self, task: &str) -> BTreeMap<String, StoredValue> {
        self.outputs
            .get(task)
            .map(|b| b.values.clone())
            .unwrap_or_default()
    }

    /// Snapshot for expression evaluation.
    pub fn context(&self) -> VariableContext {
        let mut ctx = VariableContext::new();
        for (name, value) in &self.globals {
            ctx.insert_param(name.clone(), value.clone());
        }
        for (task, bindings) in &self.outputs {
            for (name, value) in &bindings.values {
                ctx.insert_output(task.clone(), name.clone(), value.as_scalar());
            }
        }
        ctx
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::workflow::ArtifactRef;

    fn output(task: &str, name: &str) -> VarPath {
        VarPath::TaskOutput {
            task: task.into(),
            output: name.into(),
        }
    }

    fn store() -> ParameterStore {
        let mut globals = BTreeMap::new();
        globals.insert("env".to_string(), json!("staging"));
        ParameterStore::new(globals)
    }

    #[test]
    fn test_resolve_global_and_output() {
        let mut s = store();
        s.begin_attempt("build", 1);
        s.bind("build", "tag", json!("v1").into()).unwrap();

        assert_eq!(
            s.resolve(&VarPath::Param("env".into())).unwrap(),
            StoredValue::Parameter(json!("staging"))
        );
        assert_eq!(
            s.resolve(&output("build", "tag")).unwrap(),
            StoredValue::Parameter(json!("v1"))
        );
    }

    #[test]
    fn test_unbound_reference_fails() {
        let s = store();
        assert_eq!(
            s.resolve(&output("build", "tag")).unwrap_err(),
            StoreError::UnresolvedReference("tasks.build.outputs.tag".into())
        );
        assert!(s.resolve(&VarPath::Param("region".into())).is_err());
    }

    #[test]
    fn test_bind_is_write_once_per_attempt() {
        let mut s = store();
        s.begin_attempt("build", 2);
        s.bind("build", "tag", json!("a").into()).unwrap();
        let err = s.bind("build", "tag", json!("b").into()).unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicateOutput {
                task: "build".into(),
                output: "tag".into(),
                attempt: 2
            }
        );
        // The first binding wins.
        assert_eq!(
            s.resolve(&output("build", "tag")).unwrap(),
            StoredValue::Parameter(json!("a"))
        );
    }

    #[test]
    fn test_new_attempt_clears_prior_bindings() {
        let mut s = store();
        s.begin_attempt("build", 1);
        s.bind("build", "tag", json!("a").into()).unwrap();

        s.begin_attempt("build", 2);
        assert!(s.resolve(&output("build", "tag")).is_err());
        s.bind("build", "tag", json!("b").into()).unwrap();
        assert_eq!(s.outputs_of("build").len(), 1);
    }

    #[test]
    fn test_oversized_parameter_rejected() {
        let mut s = store();
        s.begin_attempt("dump", 1);
        let big = json!("x".repeat(MAX_PARAMETER_BYTES + 1));
        assert!(matches!(
            s.bind("dump", "blob", big.into()),
            Err(StoreError::OutputTooLarge { .. })
        ));

        // Artifacts are pointers and are never size-checked.
        let artifact = ArtifactRef {
            size_bytes: Some(10 * MAX_PARAMETER_BYTES as u64),
            ..ArtifactRef::new("file:///tmp/blob.bin")
        };
        s.bind("dump", "blob", artifact.into()).unwrap();
    }

    #[test]
    fn test_context_exposes_artifacts_as_uri() {
        let mut s = store();
        s.begin_attempt("package", 1);
        s.bind("package", "bundle", ArtifactRef::new("s3://b/k.tgz").into())
            .unwrap();

        let ctx = s.context();
        assert_eq!(ctx.lookup(&VarPath::Param("env".into())), Some(&json!("staging")));
        assert_eq!(
            ctx.lookup(&output("package", "bundle")),
            Some(&json!("s3://b/k.tgz"))
        );
    }
}
