//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, checks the
//! structural constraints that do not need the dependency graph (name
//! format, unique task names, known dependencies, retry sanity), and
//! provides discovery for workflow files on disk. Graph-level checks live in
//! `dag::Workflow::load`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use weft_types::workflow::WorkflowDefinition;

use super::expression::{EvalError, is_name};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Load-time errors. A workflow that fails validation never produces a run.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural validation failure.
    #[error("invalid workflow: {0}")]
    Invalid(String),

    /// Two tasks share a name.
    #[error("duplicate task name: '{0}'")]
    DuplicateTask(String),

    /// A task depends on a task that does not exist.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("cycle detected involving task '{0}'")]
    CycleDetected(String),

    /// A `when` gate or template does not parse.
    #[error("task '{task}': invalid expression: {source}")]
    Expression {
        task: String,
        #[source]
        source: EvalError,
    },

    /// A reference points to no declared parameter or upstream output.
    #[error("task '{task}': unresolved reference '{reference}': {reason}")]
    UnresolvedReference {
        task: String,
        reference: String,
        reason: String,
    },

    /// A submitted parameter is not declared by the workflow.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, ValidationError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| ValidationError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, ValidationError> {
    serde_yaml_ng::to_string(def).map_err(|e| ValidationError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters, `-` and `_`
/// - At least one task exists
/// - Task, parameter and output names are well formed
/// - All task names are unique
/// - All `depends_on` entries point to existing tasks, without self-loops
/// - `max_parallelism >= 1` and `timeout_ms > 0` if set
/// - Retry backoff is sane (`factor >= 1`, `base_ms <= max_ms`)
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.name.is_empty() {
        return Err(ValidationError::Invalid(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !is_name(&def.name) {
        return Err(ValidationError::Invalid(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric, '-' and '_' allowed)",
            def.name
        )));
    }

    if def.tasks.is_empty() {
        return Err(ValidationError::Invalid(
            "workflow must have at least one task".to_string(),
        ));
    }

    for param in def.params.keys() {
        if !is_name(param) {
            return Err(ValidationError::Invalid(format!(
                "invalid parameter name '{param}'"
            )));
        }
    }

    let mut seen = HashSet::new();
    for task in &def.tasks {
        if !is_name(&task.name) {
            return Err(ValidationError::Invalid(format!(
                "invalid task name '{}'",
                task.name
            )));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(ValidationError::DuplicateTask(task.name.clone()));
        }
    }

    for task in &def.tasks {
        let mut outputs = HashSet::new();
        for output in &task.outputs {
            if !is_name(&output.name) || !outputs.insert(output.name.as_str()) {
                return Err(ValidationError::Invalid(format!(
                    "task '{}' has an invalid or duplicate output '{}'",
                    task.name, output.name
                )));
            }
        }

        for dep in &task.depends_on {
            if dep == &task.name {
                return Err(ValidationError::CycleDetected(task.name.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if task.timeout_ms == Some(0) {
            return Err(ValidationError::Invalid(format!(
                "task '{}': timeout_ms must be > 0",
                task.name
            )));
        }

        if let Some(retry) = &task.retry {
            let b = &retry.backoff;
            if !b.factor.is_finite() || b.factor < 1.0 {
                return Err(ValidationError::Invalid(format!(
                    "task '{}': backoff factor must be >= 1",
                    task.name
                )));
            }
            if b.base_ms > b.max_ms {
                return Err(ValidationError::Invalid(format!(
                    "task '{}': backoff base_ms must not exceed max_ms",
                    task.name
                )));
            }
        }
    }

    if def.max_parallelism == Some(0) {
        return Err(ValidationError::Invalid(
            "max_parallelism must be >= 1".to_string(),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, ValidationError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, ValidationError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), ValidationError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
