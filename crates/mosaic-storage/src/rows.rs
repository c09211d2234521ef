//! Mapping between `Task` nodes and `tasks` rows.
//!
//! A row carries the identifying and accounting columns explicitly plus a
//! `data` payload with the node-specific fields (descriptions, phase
//! cursor, job spec). Children are rows of their own, linked by
//! `parent_id` and ordered by `position`; the payload never nests tasks.

use std::collections::HashMap;

use serde_json::Value;

use mosaic_core::{SubmissionId, TaskId};
use mosaic_workflow::driver::{ParallelStage, SequentialStage, Workflow, WorkflowStep};
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::task::{
    CollectJob, InitJob, MultiRunJobCollection, RunJob, RunJobCollection, Task, TaskState,
};

use crate::store::StoreError;

/// One row of the `tasks` table
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub state: TaskState,
    pub exitcode: Option<i32>,
    pub time_secs: Option<f64>,
    pub memory_mb: Option<f64>,
    pub cpu_time_secs: Option<f64>,
    pub submission_id: SubmissionId,
    pub parent_id: Option<TaskId>,
    pub position: i32,
    pub data: Value,
}

impl TaskRow {
    /// Build the row of an already-identified task
    pub fn from_task(
        task: &Task,
        parent_id: Option<TaskId>,
        position: i32,
    ) -> Result<Self, StoreError> {
        let id = task
            .data()
            .persistent_id
            .ok_or_else(|| StoreError::Unsaved(task.name().to_string()))?;
        let execution = &task.data().execution;
        Ok(Self {
            id,
            name: task.name().to_string(),
            task_type: task.type_name().to_string(),
            state: execution.state,
            exitcode: execution.exitcode,
            time_secs: execution.duration_secs,
            memory_mb: execution.max_used_memory_mb,
            cpu_time_secs: execution.used_cpu_time_secs,
            submission_id: task.data().submission_id,
            parent_id,
            position,
            data: payload(task)?,
        })
    }
}

/// Serialize the node-specific payload of a task (children excluded)
pub fn payload(task: &Task) -> Result<Value, StoreError> {
    let result = match task {
        Task::Init(t) => serde_json::to_value(t),
        Task::Run(t) => serde_json::to_value(t),
        Task::Collect(t) => serde_json::to_value(t),
        Task::RunCollection(t) => serde_json::to_value(t),
        Task::MultiRunCollection(t) => serde_json::to_value(t),
        Task::Step(t) => serde_json::to_value(t),
        Task::SequentialStage(t) => serde_json::to_value(t),
        Task::ParallelStage(t) => serde_json::to_value(t),
        Task::Workflow(t) => serde_json::to_value(t),
    };
    result.map_err(|e| StoreError::Serialization(e.to_string()))
}

fn node_from_row(row: &TaskRow) -> Result<Task, StoreError> {
    fn de<T: serde::de::DeserializeOwned>(row: &TaskRow) -> Result<T, StoreError> {
        serde_json::from_value(row.data.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
    let mut task = match row.task_type.as_str() {
        "InitJob" => Task::Init(de::<InitJob>(row)?),
        "RunJob" => Task::Run(de::<RunJob>(row)?),
        "CollectJob" => Task::Collect(de::<CollectJob>(row)?),
        "RunJobCollection" => Task::RunCollection(de::<RunJobCollection>(row)?),
        "MultiRunJobCollection" => Task::MultiRunCollection(de::<MultiRunJobCollection>(row)?),
        "WorkflowStep" => Task::Step(de::<WorkflowStep>(row)?),
        "SequentialStage" => Task::SequentialStage(de::<SequentialStage>(row)?),
        "ParallelStage" => Task::ParallelStage(de::<ParallelStage>(row)?),
        "Workflow" => Task::Workflow(de::<Workflow>(row)?),
        other => return Err(StoreError::UnknownTaskType(other.to_string())),
    };
    let data = task.data_mut();
    data.persistent_id = Some(row.id);
    data.name = row.name.clone();
    data.submission_id = row.submission_id;
    data.execution.state = row.state;
    data.execution.exitcode = row.exitcode;
    data.execution.duration_secs = row.time_secs;
    data.execution.max_used_memory_mb = row.memory_mb;
    data.execution.used_cpu_time_secs = row.cpu_time_secs;
    Ok(task)
}

/// Reassemble the subtree rooted at `root_id` from its rows
pub fn assemble(rows: &[TaskRow], root_id: TaskId) -> Result<Task, StoreError> {
    let by_id: HashMap<TaskId, &TaskRow> = rows.iter().map(|row| (row.id, row)).collect();
    let mut children: HashMap<TaskId, Vec<&TaskRow>> = HashMap::new();
    for row in rows {
        if row.id == root_id {
            continue;
        }
        if let Some(parent) = row.parent_id {
            if !by_id.contains_key(&parent) {
                return Err(StoreError::MissingParent {
                    task: row.id,
                    parent,
                });
            }
            children.entry(parent).or_default().push(row);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|row| row.position);
    }
    let root = by_id
        .get(&root_id)
        .ok_or(StoreError::TaskNotFound(root_id))?;
    assemble_node(root, &children)
}

fn assemble_node(
    row: &TaskRow,
    children: &HashMap<TaskId, Vec<&TaskRow>>,
) -> Result<Task, StoreError> {
    let mut task = node_from_row(row)?;
    if let Some(rows) = children.get(&row.id) {
        for child_row in rows {
            let child = assemble_node(child_row, children)?;
            task.append_child(child);
        }
    }
    Ok(task)
}

/// Build a status snapshot from rows, truncated at `depth`
pub fn status_tree(
    rows: &[TaskRow],
    root_id: TaskId,
    depth: usize,
) -> Result<TaskStatus, StoreError> {
    let by_id: HashMap<TaskId, &TaskRow> = rows.iter().map(|row| (row.id, row)).collect();
    let mut children: HashMap<TaskId, Vec<&TaskRow>> = HashMap::new();
    for row in rows {
        if let Some(parent) = row.parent_id {
            children.entry(parent).or_default().push(row);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|row| row.position);
    }
    let root = by_id
        .get(&root_id)
        .ok_or(StoreError::TaskNotFound(root_id))?;
    Ok(status_node(root, &children, depth))
}

fn status_node(
    row: &TaskRow,
    children: &HashMap<TaskId, Vec<&TaskRow>>,
    depth: usize,
) -> TaskStatus {
    let mut counts = std::collections::BTreeMap::new();
    count_states(row, children, &mut counts);
    let subtasks = if depth > 0 {
        children
            .get(&row.id)
            .map(|rows| {
                rows.iter()
                    .map(|child| status_node(child, children, depth - 1))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    TaskStatus {
        id: Some(row.id),
        name: row.name.clone(),
        task_type: row.task_type.clone(),
        state: row.state,
        exitcode: row.exitcode,
        memory_mb: row.memory_mb,
        cpu_time_secs: row.cpu_time_secs,
        walltime_secs: row.time_secs,
        state_counts: counts,
        subtasks,
    }
}

fn count_states(
    row: &TaskRow,
    children: &HashMap<TaskId, Vec<&TaskRow>>,
    counts: &mut std::collections::BTreeMap<String, usize>,
) {
    *counts.entry(row.state.to_string()).or_insert(0) += 1;
    if let Some(rows) = children.get(&row.id) {
        for child in rows {
            count_states(child, children, counts);
        }
    }
}
