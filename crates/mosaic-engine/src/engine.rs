//! The execution engine: a thin scheduler driving the task tree against a
//! cluster backend.
//!
//! One `progress()` call performs a single scheduling tick: eligible leaves
//! are submitted (bounded by the in-flight limits), running leaves are
//! polled, collection states are re-derived from their children, and
//! sequential drivers advance through their `next` transitions. Accounting
//! is persisted to the store after every tick; the tree structure is saved
//! whenever a transition created new tasks.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

use mosaic_core::TaskId;
use mosaic_storage::TaskStore;
use mosaic_workflow::driver::WorkflowContext;
use mosaic_workflow::task::{aggregate_state, Task, TaskState};

use crate::backend::{BackendJobState, ClusterBackend};
use crate::EngineError;

/// Bounds on concurrently managed physical jobs
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Maximum number of jobs submitted to the scheduler at once
    pub max_submitted: usize,

    /// Maximum number of jobs in flight (submitted or running)
    pub max_in_flight: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_submitted: 2000,
            max_in_flight: 2000,
        }
    }
}

/// Execution engine adapter
///
/// Owns the task trees it manages, keyed by their persistent root id. The
/// engine guarantees at most one concurrent physical job per leaf task.
pub struct Engine {
    backend: Arc<dyn ClusterBackend>,
    store: Arc<dyn TaskStore>,
    ctx: WorkflowContext,
    limits: EngineLimits,
    roots: Vec<Task>,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        store: Arc<dyn TaskStore>,
        ctx: WorkflowContext,
    ) -> Self {
        Self {
            backend,
            store,
            ctx,
            limits: EngineLimits::default(),
            roots: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    /// Place a saved task tree under engine management; idempotent
    pub fn add(&mut self, task: Task) -> Result<TaskId, EngineError> {
        let id = task
            .data()
            .persistent_id
            .ok_or_else(|| EngineError::Unsaved(task.name().to_string()))?;
        if self.root(id).is_none() {
            debug!(task = task.name(), id, "add task to engine");
            self.roots.push(task);
        }
        Ok(id)
    }

    /// Detach a task tree from engine management
    ///
    /// Required before a logically identical task is re-added.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let index = self
            .roots
            .iter()
            .position(|t| t.data().persistent_id == Some(id))?;
        Some(self.roots.remove(index))
    }

    /// The managed tree rooted at `id`
    pub fn root(&self, id: TaskId) -> Option<&Task> {
        self.roots
            .iter()
            .find(|t| t.data().persistent_id == Some(id))
    }

    fn root_mut(&mut self, id: TaskId) -> Result<&mut Task, EngineError> {
        self.roots
            .iter_mut()
            .find(|t| t.data().persistent_id == Some(id))
            .ok_or(EngineError::UnknownTask(id))
    }

    /// Reset the tree rooted at `id` from child `index` onwards so the next
    /// tick resubmits; `index = 0` redoes everything
    pub async fn redo(&mut self, id: TaskId, index: usize) -> Result<(), EngineError> {
        info!(id, index, "redo task");
        let store = self.store.clone();
        let root = self.root_mut(id)?;
        root.reset_for_redo(index);
        store.save(root).await?;
        store.update_accounting(root).await?;
        Ok(())
    }

    /// Request cancellation of the tree rooted at `id`
    ///
    /// In-flight jobs are cancelled at the backend and reach `STOPPED` on a
    /// later tick; leaves that were never submitted stop immediately.
    pub async fn kill(&mut self, id: TaskId) -> Result<(), EngineError> {
        info!(id, "kill task");
        let mut handles = Vec::new();
        {
            let root = self.root_mut(id)?;
            collect_kill(root, &mut handles);
        }
        for handle in handles {
            if let Err(error) = self.backend.cancel(&handle).await {
                error!(%error, "failed to cancel job");
            }
        }
        Ok(())
    }

    /// Perform one scheduling tick; non-blocking
    pub async fn progress(&mut self) -> Result<(), EngineError> {
        let mut roots = std::mem::take(&mut self.roots);
        let result = self.tick(&mut roots).await;
        self.roots = roots;
        result
    }

    async fn tick(&self, roots: &mut [Task]) -> Result<(), EngineError> {
        let active: usize = roots.iter().map(count_in_flight).sum();
        let limit = self.limits.max_submitted.min(self.limits.max_in_flight);
        let mut budget = limit.saturating_sub(active);
        for root in roots.iter_mut() {
            let transitioned = self.progress_node(root, &mut budget).await?;
            if transitioned {
                self.store.save(root).await?;
            }
            self.store.update_accounting(root).await?;
        }
        Ok(())
    }

    fn progress_node<'a>(
        &'a self,
        task: &'a mut Task,
        budget: &'a mut usize,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        Box::pin(async move {
            if task.state().is_terminal() {
                return Ok(false);
            }
            if task.is_leaf() {
                self.progress_leaf(task, budget).await?;
                return Ok(false);
            }
            if task.is_sequential() {
                self.progress_sequential(task, budget).await
            } else {
                self.progress_parallel(task, budget).await
            }
        })
    }

    async fn progress_leaf(&self, task: &mut Task, budget: &mut usize) -> Result<(), EngineError> {
        match task.state() {
            TaskState::New => {
                if *budget == 0 {
                    return Ok(());
                }
                let spec = task
                    .job_spec()
                    .cloned()
                    .ok_or_else(|| EngineError::Backend("leaf without job spec".into()))?;
                let resources = task
                    .resources()
                    .cloned()
                    .ok_or_else(|| EngineError::Backend("leaf without resources".into()))?;
                let handle = self.backend.submit(&spec, &resources).await?;
                debug!(job = %spec.job_name(), %handle, "submitted job");
                task.set_handle(Some(handle));
                task.set_state(TaskState::Submitted);
                *budget -= 1;
            }
            TaskState::Submitted | TaskState::Running => {
                let Some(handle) = task.handle().map(str::to_string) else {
                    // The handle was lost (resumed from a crash while the
                    // job was in flight); resubmit on the next tick. Run
                    // phases are idempotent by contract.
                    task.set_state(TaskState::New);
                    return Ok(());
                };
                match self.backend.status(&handle).await? {
                    BackendJobState::Submitted => {}
                    BackendJobState::Running => task.set_state(TaskState::Running),
                    BackendJobState::Terminated {
                        exitcode,
                        accounting,
                    } => {
                        let execution = &mut task.data_mut().execution;
                        execution.state = TaskState::Terminated;
                        execution.exitcode = Some(exitcode);
                        execution.duration_secs = accounting.duration_secs;
                        execution.max_used_memory_mb = accounting.max_memory_mb;
                        execution.used_cpu_time_secs = accounting.cpu_time_secs;
                        task.set_handle(None);
                    }
                    BackendJobState::Stopped {
                        exitcode,
                        accounting,
                    } => {
                        let execution = &mut task.data_mut().execution;
                        execution.state = TaskState::Stopped;
                        execution.exitcode = exitcode;
                        execution.duration_secs = accounting.duration_secs;
                        task.set_handle(None);
                    }
                }
            }
            TaskState::Stopped | TaskState::Terminated => {}
        }
        Ok(())
    }

    async fn progress_parallel(
        &self,
        task: &mut Task,
        budget: &mut usize,
    ) -> Result<bool, EngineError> {
        let mut transitioned = false;
        if let Some(children) = task.children_mut() {
            for child in children.iter_mut() {
                transitioned |= self.progress_node(child, budget).await?;
            }
        }
        let (state, exitcode) = aggregate_state(task.children().unwrap_or(&[]));
        task.set_state(state);
        if state.is_terminal() {
            task.data_mut().execution.exitcode = exitcode;
        }
        Ok(transitioned)
    }

    async fn progress_sequential(
        &self,
        task: &mut Task,
        budget: &mut usize,
    ) -> Result<bool, EngineError> {
        let n_children = task.children().map(<[Task]>::len).unwrap_or(0);
        if n_children == 0 {
            // A workflow with all stages inactive terminates immediately.
            task.set_state(TaskState::Terminated);
            task.data_mut().execution.exitcode.get_or_insert(0);
            return Ok(true);
        }
        let current = task.current_child().unwrap_or(0).min(n_children - 1);
        let mut transitioned = false;
        {
            let children = task.children_mut().expect("sequential task has children");
            transitioned |= self.progress_node(&mut children[current], budget).await?;
        }
        let child = &task.children().expect("sequential task has children")[current];
        let child_state = child.state();
        let child_exitcode = child.exitcode();
        match child_state {
            TaskState::Terminated => {
                match self.next_transition(task, current) {
                    Ok(state) => task.set_state(state),
                    Err(error) => {
                        error!(task = task.name(), %error, "transition failed; stopping");
                        task.set_state(TaskState::Terminated);
                        let execution = &mut task.data_mut().execution;
                        if execution.exitcode.unwrap_or(0) == 0 {
                            execution.exitcode = Some(1);
                        }
                    }
                }
                transitioned = true;
            }
            TaskState::Stopped => {
                task.set_state(TaskState::Stopped);
                task.data_mut().execution.exitcode = child_exitcode;
            }
            TaskState::New => {}
            TaskState::Submitted | TaskState::Running => task.set_state(TaskState::Running),
        }
        Ok(transitioned)
    }

    fn next_transition(&self, task: &mut Task, done: usize) -> Result<TaskState, mosaic_core::WorkflowError> {
        match task {
            Task::Step(step) => step.next(done, &self.ctx),
            Task::MultiRunCollection(multi) => Ok(multi.next(done)),
            Task::SequentialStage(stage) => stage.next(done, &self.ctx),
            Task::Workflow(workflow) => workflow.next(done, &self.ctx),
            other => Err(mosaic_core::WorkflowError::transition(format!(
                "task \"{}\" is not a sequential collection",
                other.name()
            ))),
        }
    }
}

fn count_in_flight(task: &Task) -> usize {
    if task.is_leaf() {
        return usize::from(matches!(
            task.state(),
            TaskState::Submitted | TaskState::Running
        ));
    }
    task.children()
        .map(|children| children.iter().map(count_in_flight).sum())
        .unwrap_or(0)
}

fn collect_kill(task: &mut Task, handles: &mut Vec<String>) {
    if task.is_leaf() {
        match task.state() {
            TaskState::New => {
                task.set_state(TaskState::Stopped);
            }
            TaskState::Submitted | TaskState::Running => {
                if let Some(handle) = task.handle() {
                    handles.push(handle.to_string());
                }
            }
            _ => {}
        }
        return;
    }
    if let Some(children) = task.children_mut() {
        for child in children {
            collect_kill(child, handles);
        }
    }
}
