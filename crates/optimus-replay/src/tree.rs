//! Execution tree: the planner's output.
//!
//! Nodes live in a map keyed by `project/job` and reference their
//! dependents by key, so the structure has no pointer cycles and
//! serializes as-is. A (project, job) pair appears at most once; runs
//! reached over multiple paths are unioned into the one node.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key of a node: `project/job`.
pub fn node_key(project_name: &str, job_name: &str) -> String {
    format!("{}/{}", project_name, job_name)
}

/// A job in the execution tree with its run instants and dependent edges.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionTreeNode {
    pub project_name: String,
    pub job_name: String,
    /// Run instants to re-execute, ascending.
    pub runs: BTreeSet<DateTime<Utc>>,
    /// Keys of dependent nodes, ordered by job name.
    pub dependents: Vec<String>,
}

impl ExecutionTreeNode {
    pub fn new(project_name: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            job_name: job_name.into(),
            runs: BTreeSet::new(),
            dependents: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        node_key(&self.project_name, &self.job_name)
    }
}

/// Tree of jobs to re-execute, rooted at the replayed job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionTree {
    root: String,
    nodes: BTreeMap<String, ExecutionTreeNode>,
}

impl ExecutionTree {
    pub fn new(root: ExecutionTreeNode) -> Self {
        let key = root.key();
        let mut nodes = BTreeMap::new();
        nodes.insert(key.clone(), root);
        Self { root: key, nodes }
    }

    pub fn root_key(&self) -> &str {
        &self.root
    }

    pub fn root(&self) -> Option<&ExecutionTreeNode> {
        self.nodes.get(&self.root)
    }

    pub fn node(&self, key: &str) -> Option<&ExecutionTreeNode> {
        self.nodes.get(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ExecutionTreeNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Inserts the node if absent; merges runs into an existing node
    /// otherwise (diamond paths union their run sets).
    pub fn upsert(&mut self, node: ExecutionTreeNode) {
        let key = node.key();
        match self.nodes.get_mut(&key) {
            Some(existing) => existing.runs.extend(node.runs),
            None => {
                self.nodes.insert(key, node);
            }
        }
    }

    /// Records a dependent edge. Duplicate edges collapse; dependents stay
    /// ordered by job name (then key for distinct projects sharing a job
    /// name).
    pub fn add_dependent(&mut self, parent_key: &str, child_key: &str) {
        let sort_key = |key: &str| {
            let job = key.split_once('/').map(|(_, job)| job).unwrap_or(key);
            (job.to_string(), key.to_string())
        };
        if let Some(parent) = self.nodes.get_mut(parent_key) {
            if !parent.dependents.iter().any(|k| k == child_key) {
                parent.dependents.push(child_key.to_string());
                parent.dependents.sort_by_key(|k| sort_key(k));
            }
        }
    }
}
