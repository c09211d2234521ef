//! In-memory representation of the task tree.
//!
//! A submission owns exactly one root task. Collections own their children
//! by value; back-references exist only as `parent_id` columns once the
//! tree is persisted, so no in-memory cycles are formed.

mod execution;

pub use execution::{Execution, ResourceRequest, TaskState};

use serde::{Deserialize, Serialize};

use mosaic_core::{SubmissionId, TaskId};

use crate::driver::{ParallelStage, SequentialStage, Workflow, WorkflowStep};
use crate::jobs::JobSpec;

/// Fields common to every task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    /// Identity assigned on first save; `None` for unsaved tasks
    #[serde(skip)]
    pub persistent_id: Option<TaskId>,

    /// Human-readable name, used in logs and snapshots
    pub name: String,

    /// Submission this task belongs to
    pub submission_id: SubmissionId,

    /// Execution record; owned by the engine once submitted
    #[serde(skip)]
    pub execution: Execution,
}

impl JobData {
    pub fn new(name: impl Into<String>, submission_id: SubmissionId) -> Self {
        Self {
            persistent_id: None,
            name: name.into(),
            submission_id,
            execution: Execution::new(),
        }
    }
}

/// Job for the *init* phase of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitJob {
    pub data: JobData,
    pub spec: JobSpec,
    pub resources: ResourceRequest,

    /// Backend-assigned handle of the in-flight physical job
    #[serde(skip)]
    pub handle: Option<String>,
}

/// Job for the *run* phase of a step; processed in parallel with its siblings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub data: JobData,

    /// One-based identifier, unique within the run phase
    pub job_id: u32,

    /// Index of the owning collection for steps with multiple run sub-phases
    pub index: Option<u32>,

    pub spec: JobSpec,
    pub resources: ResourceRequest,

    #[serde(skip)]
    pub handle: Option<String>,
}

/// Job for the *collect* phase of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectJob {
    pub data: JobData,
    pub spec: JobSpec,
    pub resources: ResourceRequest,

    #[serde(skip)]
    pub handle: Option<String>,
}

/// Parallel collection of run jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobCollection {
    pub data: JobData,
    pub step_name: String,

    /// Index for steps with multiple run sub-phases
    pub index: Option<u32>,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl RunJobCollection {
    pub fn new(step_name: impl Into<String>, submission_id: SubmissionId, index: Option<u32>) -> Self {
        let step_name = step_name.into();
        let name = match index {
            None => format!("{step_name}_run"),
            Some(index) => format!("{step_name}_run-{index:02}"),
        };
        Self {
            data: JobData::new(name, submission_id),
            step_name,
            index,
            tasks: Vec::new(),
        }
    }
}

/// Sequential collection of run job collections, one per sub-phase index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRunJobCollection {
    pub data: JobData,
    pub step_name: String,

    /// Zero-based index of the collection currently being processed
    pub current: usize,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl MultiRunJobCollection {
    pub fn new(step_name: impl Into<String>, submission_id: SubmissionId) -> Self {
        let step_name = step_name.into();
        Self {
            data: JobData::new(format!("{step_name}_run"), submission_id),
            step_name,
            current: 0,
            tasks: Vec::new(),
        }
    }

    /// Progress to the next sub-phase collection (abort on error)
    pub fn next(&mut self, done: usize) -> TaskState {
        let exitcode = self.tasks[done].exitcode();
        self.data.execution.exitcode = exitcode;
        if exitcode != Some(0) {
            return TaskState::Terminated;
        }
        if done + 1 < self.tasks.len() {
            self.current = done + 1;
            TaskState::Running
        } else {
            TaskState::Terminated
        }
    }
}

/// A node in the task tree
///
/// The variant names double as the subtype tags in the `tasks` table.
#[derive(Debug, Clone)]
pub enum Task {
    Init(InitJob),
    Run(RunJob),
    Collect(CollectJob),
    RunCollection(RunJobCollection),
    MultiRunCollection(MultiRunJobCollection),
    Step(WorkflowStep),
    SequentialStage(SequentialStage),
    ParallelStage(ParallelStage),
    Workflow(Workflow),
}

impl Task {
    /// Subtype tag stored in the `type` column
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init(_) => "InitJob",
            Self::Run(_) => "RunJob",
            Self::Collect(_) => "CollectJob",
            Self::RunCollection(_) => "RunJobCollection",
            Self::MultiRunCollection(_) => "MultiRunJobCollection",
            Self::Step(_) => "WorkflowStep",
            Self::SequentialStage(_) => "SequentialStage",
            Self::ParallelStage(_) => "ParallelStage",
            Self::Workflow(_) => "Workflow",
        }
    }

    /// Common fields of the task
    pub fn data(&self) -> &JobData {
        match self {
            Self::Init(t) => &t.data,
            Self::Run(t) => &t.data,
            Self::Collect(t) => &t.data,
            Self::RunCollection(t) => &t.data,
            Self::MultiRunCollection(t) => &t.data,
            Self::Step(t) => &t.data,
            Self::SequentialStage(t) => &t.data,
            Self::ParallelStage(t) => &t.data,
            Self::Workflow(t) => &t.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut JobData {
        match self {
            Self::Init(t) => &mut t.data,
            Self::Run(t) => &mut t.data,
            Self::Collect(t) => &mut t.data,
            Self::RunCollection(t) => &mut t.data,
            Self::MultiRunCollection(t) => &mut t.data,
            Self::Step(t) => &mut t.data,
            Self::SequentialStage(t) => &mut t.data,
            Self::ParallelStage(t) => &mut t.data,
            Self::Workflow(t) => &mut t.data,
        }
    }

    /// Children of a collection; `None` for leaf jobs
    pub fn children(&self) -> Option<&[Task]> {
        match self {
            Self::Init(_) | Self::Run(_) | Self::Collect(_) => None,
            Self::RunCollection(t) => Some(&t.tasks),
            Self::MultiRunCollection(t) => Some(&t.tasks),
            Self::Step(t) => Some(&t.tasks),
            Self::SequentialStage(t) => Some(&t.tasks),
            Self::ParallelStage(t) => Some(&t.tasks),
            Self::Workflow(t) => Some(&t.tasks),
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Task>> {
        match self {
            Self::Init(_) | Self::Run(_) | Self::Collect(_) => None,
            Self::RunCollection(t) => Some(&mut t.tasks),
            Self::MultiRunCollection(t) => Some(&mut t.tasks),
            Self::Step(t) => Some(&mut t.tasks),
            Self::SequentialStage(t) => Some(&mut t.tasks),
            Self::ParallelStage(t) => Some(&mut t.tasks),
            Self::Workflow(t) => Some(&mut t.tasks),
        }
    }

    /// Whether this task is an individual cluster job
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Init(_) | Self::Run(_) | Self::Collect(_))
    }

    /// Job description of a leaf; `None` for collections
    pub fn job_spec(&self) -> Option<&JobSpec> {
        match self {
            Self::Init(t) => Some(&t.spec),
            Self::Run(t) => Some(&t.spec),
            Self::Collect(t) => Some(&t.spec),
            _ => None,
        }
    }

    /// Resource request of a leaf; `None` for collections
    pub fn resources(&self) -> Option<&ResourceRequest> {
        match self {
            Self::Init(t) => Some(&t.resources),
            Self::Run(t) => Some(&t.resources),
            Self::Collect(t) => Some(&t.resources),
            _ => None,
        }
    }

    /// Backend handle of a leaf's in-flight physical job
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Init(t) => t.handle.as_deref(),
            Self::Run(t) => t.handle.as_deref(),
            Self::Collect(t) => t.handle.as_deref(),
            _ => None,
        }
    }

    pub fn set_handle(&mut self, handle: Option<String>) {
        match self {
            Self::Init(t) => t.handle = handle,
            Self::Run(t) => t.handle = handle,
            Self::Collect(t) => t.handle = handle,
            _ => {}
        }
    }

    pub fn name(&self) -> &str {
        &self.data().name
    }

    pub fn state(&self) -> TaskState {
        self.data().execution.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.data_mut().execution.state = state;
    }

    pub fn exitcode(&self) -> Option<i32> {
        self.data().execution.exitcode
    }

    pub fn is_new(&self) -> bool {
        self.state() == TaskState::New
    }

    pub fn is_submitted(&self) -> bool {
        self.state() == TaskState::Submitted
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TaskState::Stopped
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    /// Zero-based index of the child a sequential collection is processing
    pub fn current_child(&self) -> Option<usize> {
        match self {
            Self::MultiRunCollection(t) => Some(t.current),
            Self::Step(t) => Some(t.current),
            Self::SequentialStage(t) => Some(t.current),
            Self::Workflow(t) => Some(t.current),
            _ => None,
        }
    }

    /// Whether the children of this collection run sequentially
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            Self::MultiRunCollection(_) | Self::Step(_) | Self::SequentialStage(_) | Self::Workflow(_)
        )
    }

    /// Reset execution records so the next engine tick resubmits
    ///
    /// Children of a sequential collection before `from_index` are left
    /// untouched (same identity, same return code). The child at
    /// `from_index` is resumed: it resets from its own cursor, so work it
    /// completed before a crash is preserved. Children after `from_index`
    /// are reset wholesale; sequential parents rebuild them on transition
    /// anyway. Parallel collections keep successfully terminated children
    /// and resume the rest. `from_index = 0` redoes the whole tree.
    pub fn reset_for_redo(&mut self, from_index: usize) {
        self.data_mut().execution.reset();
        self.set_handle(None);
        match self {
            Self::MultiRunCollection(t) => {
                t.current = from_index.min(t.tasks.len().saturating_sub(1));
            }
            Self::Step(t) => {
                t.current = from_index.min(t.tasks.len().saturating_sub(1));
            }
            Self::SequentialStage(t) => {
                t.current = from_index.min(t.tasks.len().saturating_sub(1));
            }
            Self::Workflow(t) => {
                t.current = from_index.min(t.tasks.len().saturating_sub(1));
            }
            _ => {}
        }
        let sequential = self.is_sequential();
        if let Some(children) = self.children_mut() {
            for (position, child) in children.iter_mut().enumerate() {
                if sequential {
                    if position == from_index {
                        let resume_at = child.current_child().unwrap_or(0);
                        child.reset_for_redo(resume_at);
                    } else if position > from_index {
                        child.reset_for_redo(0);
                    }
                } else if !(child.is_terminated() && child.exitcode() == Some(0)) {
                    let resume_at = child.current_child().unwrap_or(0);
                    child.reset_for_redo(resume_at);
                }
            }
        }
    }

    /// Append a child, preserving insertion order as its ordinal
    pub fn append_child(&mut self, child: Task) {
        if let Some(children) = self.children_mut() {
            children.push(child);
        }
    }

    /// Replace the child at `index`, keeping its ordinal
    ///
    /// Used by the step driver to swap the empty run placeholder for the
    /// populated collection at the init→run transition.
    pub fn replace_child(&mut self, index: usize, child: Task) {
        if let Some(children) = self.children_mut() {
            children[index] = child;
        }
    }
}

/// Derive the state and return code of a collection from its children
///
/// Precedence: running beats stopped beats the all-uniform cases; a
/// collection with children in mixed non-running states is `SUBMITTED`.
/// An empty collection is terminated successfully.
pub fn aggregate_state(children: &[Task]) -> (TaskState, Option<i32>) {
    if children.is_empty() {
        return (TaskState::Terminated, Some(0));
    }
    if children.iter().any(|t| t.is_running()) {
        return (TaskState::Running, None);
    }
    if children.iter().any(|t| t.is_stopped()) {
        return (TaskState::Stopped, first_failure(children));
    }
    if children.iter().all(|t| t.is_new()) {
        return (TaskState::New, None);
    }
    if children.iter().all(|t| t.is_terminated()) {
        let exitcode = first_failure(children).or(Some(0));
        return (TaskState::Terminated, exitcode);
    }
    (TaskState::Submitted, None)
}

fn first_failure(children: &[Task]) -> Option<i32> {
    children
        .iter()
        .filter_map(|t| t.exitcode())
        .find(|&code| code != 0)
}
