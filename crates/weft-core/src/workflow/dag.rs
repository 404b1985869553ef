//! Validated workflow DAG.
//!
//! `Workflow::load` is the single entry point from a `WorkflowDefinition` to
//! something the scheduler can run. It builds a `petgraph` graph of the
//! `depends_on` edges, rejects cycles via topological sort, pre-parses every
//! `when` gate and input template, and checks that every parameter
//! reference resolves either to a declared global parameter or to a declared
//! output of a transitive upstream task. A loaded `Workflow` is immutable
//! and shared across runs behind an `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use sha2::{Digest, Sha256};
use weft_types::workflow::{InputBinding, TaskTemplate, WorkflowDefinition};

use super::definition::{ValidationError, validate_definition};
use super::expression::{Expr, Template, VarPath};

// ---------------------------------------------------------------------------
// Compiled task data
// ---------------------------------------------------------------------------

/// An input binding with its expression parts pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledInput {
    Literal(Value),
    Reference(VarPath),
    Template(Template),
}

impl CompiledInput {
    fn references(&self) -> Vec<&VarPath> {
        match self {
            CompiledInput::Literal(_) => Vec::new(),
            CompiledInput::Reference(path) => vec![path],
            CompiledInput::Template(t) => t.references().collect(),
        }
    }
}

#[derive(Debug)]
struct TaskNode {
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
    condition: Option<Expr>,
    inputs: BTreeMap<String, CompiledInput>,
    ancestors: HashSet<usize>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A validated, immutable workflow ready for execution.
#[derive(Debug)]
pub struct Workflow {
    definition: WorkflowDefinition,
    index: HashMap<String, usize>,
    nodes: Vec<TaskNode>,
    hash: String,
}

impl Workflow {
    /// Validate a definition and build the executable DAG.
    pub fn load(definition: WorkflowDefinition) -> Result<Self, ValidationError> {
        validate_definition(&definition)?;

        let tasks = &definition.tasks;
        let index: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        // Edge from dependency -> dependent.
        let mut graph = DiGraph::<usize, ()>::new();
        let node_indices: Vec<_> = (0..tasks.len()).map(|i| graph.add_node(i)).collect();
        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from = *index.get(dep).ok_or_else(|| ValidationError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                })?;
                if dependencies[i].contains(&from) {
                    continue;
                }
                graph.add_edge(node_indices[from], node_indices[i], ());
                dependencies[i].push(from);
                dependents[from].push(i);
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let task = graph[cycle.node_id()];
            ValidationError::CycleDetected(tasks[task].name.clone())
        })?;

        // Ancestor sets, filled in topological order so every dependency's
        // set is complete before its dependents read it.
        let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); tasks.len()];
        for node in &sorted {
            let i = graph[*node];
            let mut set = HashSet::new();
            for &dep in &dependencies[i] {
                set.insert(dep);
                set.extend(ancestors[dep].iter().copied());
            }
            ancestors[i] = set;
        }

        let mut nodes = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            let condition = task
                .when
                .as_deref()
                .map(Expr::parse)
                .transpose()
                .map_err(|source| ValidationError::Expression {
                    task: task.name.clone(),
                    source,
                })?;

            let mut inputs = BTreeMap::new();
            for (name, binding) in &task.inputs {
                let compiled = compile_input(binding).map_err(|source| {
                    ValidationError::Expression {
                        task: task.name.clone(),
                        source,
                    }
                })?;
                inputs.insert(name.clone(), compiled);
            }

            let node = TaskNode {
                dependencies: std::mem::take(&mut dependencies[i]),
                dependents: std::mem::take(&mut dependents[i]),
                condition,
                inputs,
                ancestors: std::mem::take(&mut ancestors[i]),
            };
            check_references(&definition, &index, task, &node)?;
            nodes.push(node);
        }

        let hash = definition_hash(&definition);
        tracing::debug!(
            workflow = %definition.name,
            tasks = tasks.len(),
            hash = %hash,
            "workflow loaded"
        );

        Ok(Self {
            definition,
            index,
            nodes,
            hash,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// SHA-256 of the canonical JSON form of the definition.
    pub fn definition_hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks in definition order.
    pub fn tasks(&self) -> &[TaskTemplate] {
        &self.definition.tasks
    }

    pub fn task(&self, idx: usize) -> &TaskTemplate {
        &self.definition.tasks[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct dependencies of a task, in `depends_on` order.
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].dependencies
    }

    /// Direct dependents of a task, in definition order.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].dependents
    }

    pub fn condition(&self, idx: usize) -> Option<&Expr> {
        self.nodes[idx].condition.as_ref()
    }

    pub fn inputs(&self, idx: usize) -> &BTreeMap<String, CompiledInput> {
        &self.nodes[idx].inputs
    }

    /// Transitive dependency closure of a task, in definition order.
    /// Unknown names yield an empty list.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        let Some(idx) = self.index_of(name) else {
            return Vec::new();
        };
        let set = &self.nodes[idx].ancestors;
        self.definition
            .tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| set.contains(i))
            .map(|(_, t)| t.name.as_str())
            .collect()
    }

    /// Lazily compute the sets of tasks that can run concurrently (Kahn
    /// levels). The iterator is consumed once and cannot be restarted.
    pub fn waves(&self) -> Waves<'_> {
        let in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let current = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        Waves {
            workflow: self,
            in_degree,
            current,
        }
    }
}

/// Iterator over execution waves. See [`Workflow::waves`].
pub struct Waves<'a> {
    workflow: &'a Workflow,
    in_degree: Vec<usize>,
    current: Vec<usize>,
}

impl<'a> Iterator for Waves<'a> {
    type Item = Vec<&'a TaskTemplate>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_empty() {
            return None;
        }
        let wave = std::mem::take(&mut self.current);
        let mut next = Vec::new();
        for &i in &wave {
            for &d in self.workflow.dependents(i) {
                self.in_degree[d] -= 1;
                if self.in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        self.current = next;
        Some(wave.into_iter().map(|i| self.workflow.task(i)).collect())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of the definition's JSON serialization. Maps are
/// ordered, so equal definitions hash equally.
pub fn definition_hash(def: &WorkflowDefinition) -> String {
    let bytes = serde_json::to_vec(def).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

fn compile_input(binding: &InputBinding) -> Result<CompiledInput, super::expression::EvalError> {
    Ok(match binding {
        InputBinding::Literal(v) => CompiledInput::Literal(v.clone()),
        InputBinding::Reference { from } => CompiledInput::Reference(VarPath::parse(from)?),
        InputBinding::Template { template } => CompiledInput::Template(Template::parse(template)?),
    })
}

fn check_references(
    def: &WorkflowDefinition,
    index: &HashMap<String, usize>,
    task: &TaskTemplate,
    node: &TaskNode,
) -> Result<(), ValidationError> {
    let refs = node
        .condition
        .iter()
        .flat_map(|c| c.references())
        .chain(node.inputs.values().flat_map(|i| i.references()));

    for path in refs {
        let unresolved = |reason: String| ValidationError::UnresolvedReference {
            task: task.name.clone(),
            reference: path.to_string(),
            reason,
        };
        match path {
            VarPath::Param(name) => {
                if !def.params.contains_key(name) {
                    return Err(unresolved("no such workflow parameter".to_string()));
                }
            }
            VarPath::TaskOutput { task: upstream, output } => {
                let Some(&up) = index.get(upstream) else {
                    return Err(unresolved(format!("no task named '{upstream}'")));
                };
                if !node.ancestors.contains(&up) {
                    return Err(unresolved(format!(
                        "'{upstream}' is not upstream of '{}'",
                        task.name
                    )));
                }
                if def.tasks[up].output(output).is_none() {
                    return Err(unresolved(format!(
                        "task '{upstream}' declares no output '{output}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
