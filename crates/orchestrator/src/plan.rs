//! Task plans and DAG validation.
//!
//! A plan is accepted only when its dependency graph is a DAG; cyclic
//! plans are rejected at acceptance time as decomposition errors, never
//! "repaired".

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use av_domain::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// One node of the plan DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Target agent name (resolved through the expert registry).
    pub agent: String,
    /// Declared purpose, for humans and the aggregator prompt.
    #[serde(default)]
    pub purpose: String,
    /// Input; may reference dependency results as `{{dep_id}}`.
    pub input: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

/// A decomposed plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub analysis: String,
    pub tasks: Vec<Task>,
    /// Hint that intra-layer tasks benefit from running concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Synthesise a final response from multiple task results.
    #[serde(default)]
    pub aggregate: bool,
}

impl TaskPlan {
    /// Accept-time validation: at least one task, unique ids, known
    /// dependency references, and an acyclic graph.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Decomposition("plan contains no tasks".into()));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(Error::Decomposition("task with empty id".into()));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(Error::Decomposition(format!("duplicate task id '{}'", task.id)));
            }
            if task.agent.is_empty() {
                return Err(Error::Decomposition(format!("task '{}' names no agent", task.id)));
            }
        }

        for task in &self.tasks {
            for dep in &task.deps {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::Decomposition(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.id
                    )));
                }
                if dep == &task.id {
                    return Err(Error::Decomposition(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
            }
        }

        self.topo_layers().map(|_| ())
    }

    /// Topological layering (Kahn). Tasks within a layer have no mutual
    /// dependencies and may run concurrently; every layer only depends on
    /// earlier ones. Fails on cycles.
    pub fn topo_layers(&self) -> Result<Vec<Vec<String>>> {
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.deps.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.deps {
                dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| indegree[t.id.as_str()] == 0)
            .map(|t| t.id.as_str())
            .collect();
        let mut placed = 0usize;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for id in &current {
                if let Some(children) = dependents.get(id) {
                    for child in children {
                        let d = indegree.get_mut(child).expect("validated id");
                        *d -= 1;
                        if *d == 0 {
                            next.push(*child);
                        }
                    }
                }
            }
            layers.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if placed != self.tasks.len() {
            return Err(Error::Decomposition(
                "task dependencies form a cycle".into(),
            ));
        }
        Ok(layers)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

/// Substitute completed dependency results into a task input: each
/// `{{dep_id}}` placeholder is replaced by that dependency's result text.
/// Single pass over the input, so substituted text is never re-scanned
/// (exact id → text mapping, no recursion).
pub fn substitute_results(input: &str, results: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let id = &after[..close];
                match results.get(id) {
                    Some(result) => out.push_str(result),
                    // Unknown placeholders pass through untouched.
                    None => {
                        out.push_str("{{");
                        out.push_str(id);
                        out.push_str("}}");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
