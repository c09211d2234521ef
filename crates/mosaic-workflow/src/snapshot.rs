//! Recursive status snapshots of a task tree.
//!
//! Snapshots are what the monitor prints, what the failure report is built
//! from, and what the HTTP status server hands to the UI. Depth truncation
//! keeps snapshots of large run phases small: subtrees below the requested
//! depth are summarized by their state counts only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mosaic_core::TaskId;

use crate::task::{Task, TaskState};

/// One node of a status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: Option<TaskId>,
    pub name: String,

    /// Subtype tag of the task
    #[serde(rename = "type")]
    pub task_type: String,

    pub state: TaskState,
    pub exitcode: Option<i32>,
    pub memory_mb: Option<f64>,
    pub cpu_time_secs: Option<f64>,
    pub walltime_secs: Option<f64>,

    /// Number of tasks per state in this subtree (the node included),
    /// aggregated bottom-up
    pub state_counts: BTreeMap<String, usize>,

    /// Children up to the snapshot depth; empty below it
    pub subtasks: Vec<TaskStatus>,
}

impl TaskStatus {
    /// Build a snapshot of the subtree rooted at `task`
    ///
    /// `depth = 0` yields a snapshot containing only the root (with
    /// aggregated counts); children are recursed into while `depth > 0`.
    pub fn from_task(task: &Task, depth: usize) -> Self {
        let mut node = Self::node_without_children(task);
        node.state_counts = count_states(task);
        if depth > 0 {
            if let Some(children) = task.children() {
                node.subtasks = children
                    .iter()
                    .map(|child| Self::from_task(child, depth - 1))
                    .collect();
            }
        }
        node
    }

    fn node_without_children(task: &Task) -> Self {
        let execution = &task.data().execution;
        Self {
            id: task.data().persistent_id,
            name: task.name().to_string(),
            task_type: task.type_name().to_string(),
            state: execution.state,
            exitcode: execution.exitcode,
            memory_mb: execution.max_used_memory_mb,
            cpu_time_secs: execution.used_cpu_time_secs,
            walltime_secs: execution.duration_secs,
            state_counts: BTreeMap::new(),
            subtasks: Vec::new(),
        }
    }

    /// All failed leaves in this snapshot (terminal with non-zero exitcode)
    pub fn failed_leaves(&self) -> Vec<&TaskStatus> {
        let mut failed = Vec::new();
        self.visit(&mut |node| {
            let is_leaf = matches!(node.task_type.as_str(), "InitJob" | "RunJob" | "CollectJob");
            if is_leaf && node.state.is_terminal() && node.exitcode.unwrap_or(0) != 0 {
                failed.push(node);
            }
        });
        failed
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a TaskStatus)) {
        f(self);
        for child in &self.subtasks {
            child.visit(f);
        }
    }

    /// Render the snapshot as an indented table for terminal output
    pub fn format_table(&self) -> String {
        let mut lines = vec![format!(
            "{:<44} {:<12} {:>8}  {:>10}  {:>10}",
            "name", "state", "exitcode", "time", "memory(MB)"
        )];
        self.format_into(&mut lines, 0);
        lines.join("\n")
    }

    fn format_into(&self, lines: &mut Vec<String>, indent: usize) {
        let name = format!("{}{}", "  ".repeat(indent), self.name);
        let exitcode = self
            .exitcode
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".into());
        let time = self
            .walltime_secs
            .map(|secs| mosaic_core::duration::format_elapsed(std::time::Duration::from_secs_f64(secs.max(0.0))))
            .unwrap_or_else(|| "-".into());
        let memory = self
            .memory_mb
            .map(|mb| format!("{mb:.0}"))
            .unwrap_or_else(|| "-".into());
        lines.push(format!(
            "{:<44} {:<12} {:>8}  {:>10}  {:>10}",
            name,
            self.state.to_string(),
            exitcode,
            time,
            memory
        ));
        for child in &self.subtasks {
            child.format_into(lines, indent + 1);
        }
    }
}

fn count_states(task: &Task) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    fn recurse(task: &Task, counts: &mut BTreeMap<String, usize>) {
        *counts.entry(task.state().to_string()).or_insert(0) += 1;
        if let Some(children) = task.children() {
            for child in children {
                recurse(child, counts);
            }
        }
    }
    recurse(task, &mut counts);
    counts
}
