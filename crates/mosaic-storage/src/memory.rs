//! In-memory implementation of `TaskStore` for tests and embedded use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use mosaic_core::{ExperimentId, SubmissionId, TaskId};
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::task::Task;

use crate::rows::{assemble, status_tree, TaskRow};
use crate::store::{StoreError, Submission, TaskStore};

/// In-memory implementation of [`TaskStore`]
///
/// Provides the same semantics as the PostgreSQL implementation, including
/// the split between structural saves and accounting updates.
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRow>>,
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
    next_task_id: AtomicI64,
    next_submission_id: AtomicI64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            submissions: RwLock::new(HashMap::new()),
            next_task_id: AtomicI64::new(1),
            next_submission_id: AtomicI64::new(1),
        }
    }

    /// Number of persisted tasks
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    fn save_node(
        &self,
        rows: &mut HashMap<TaskId, TaskRow>,
        task: &mut Task,
        parent_id: Option<TaskId>,
        position: i32,
    ) -> Result<TaskId, StoreError> {
        let id = match task.data().persistent_id {
            Some(id) => id,
            None => {
                let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
                task.data_mut().persistent_id = Some(id);
                id
            }
        };
        let mut row = TaskRow::from_task(task, parent_id, position)?;
        if let Some(existing) = rows.get(&id) {
            // Structural update: the engine owns the accounting columns.
            row.state = existing.state;
            row.exitcode = existing.exitcode;
            row.time_secs = existing.time_secs;
            row.memory_mb = existing.memory_mb;
            row.cpu_time_secs = existing.cpu_time_secs;
        }
        rows.insert(id, row);
        if let Some(children) = task.children_mut() {
            let mut kept = Vec::with_capacity(children.len());
            for (index, child) in children.iter_mut().enumerate() {
                kept.push(self.save_node(rows, child, Some(id), index as i32)?);
            }
            // Children the driver replaced (e.g. the run placeholder) must
            // not be re-attached on the next load.
            let stale: Vec<TaskId> = rows
                .values()
                .filter(|row| row.parent_id == Some(id) && !kept.contains(&row.id))
                .map(|row| row.id)
                .collect();
            for stale_id in stale {
                remove_subtree(rows, stale_id);
            }
        }
        Ok(id)
    }

    fn subtree_rows(&self, root_id: TaskId) -> Result<Vec<TaskRow>, StoreError> {
        let rows = self.tasks.read();
        if !rows.contains_key(&root_id) {
            return Err(StoreError::TaskNotFound(root_id));
        }
        let mut children: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for row in rows.values() {
            if let Some(parent) = row.parent_id {
                children.entry(parent).or_default().push(row.id);
            }
        }
        let mut collected = Vec::new();
        let mut pending = vec![root_id];
        while let Some(id) = pending.pop() {
            if let Some(row) = rows.get(&id) {
                collected.push(row.clone());
            }
            if let Some(ids) = children.get(&id) {
                pending.extend(ids.iter().copied());
            }
        }
        Ok(collected)
    }

    fn update_accounting_node(&self, rows: &mut HashMap<TaskId, TaskRow>, task: &Task) {
        if let Some(id) = task.data().persistent_id {
            if let Some(row) = rows.get_mut(&id) {
                let execution = &task.data().execution;
                row.state = execution.state;
                row.exitcode = execution.exitcode;
                row.time_secs = execution.duration_secs;
                row.memory_mb = execution.max_used_memory_mb;
                row.cpu_time_secs = execution.used_cpu_time_secs;
            }
        }
        if let Some(children) = task.children() {
            for child in children {
                self.update_accounting_node(rows, child);
            }
        }
    }
}

fn remove_subtree(rows: &mut HashMap<TaskId, TaskRow>, root_id: TaskId) {
    rows.remove(&root_id);
    let children: Vec<TaskId> = rows
        .values()
        .filter(|row| row.parent_id == Some(root_id))
        .map(|row| row.id)
        .collect();
    for child in children {
        remove_subtree(rows, child);
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &mut Task) -> Result<TaskId, StoreError> {
        let mut rows = self.tasks.write();
        self.save_node(&mut rows, task, None, 0)
    }

    async fn load(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let rows = self.subtree_rows(task_id)?;
        assemble(&rows, task_id)
    }

    async fn update_accounting(&self, task: &Task) -> Result<(), StoreError> {
        let mut rows = self.tasks.write();
        self.update_accounting_node(&mut rows, task);
        Ok(())
    }

    async fn task_status(&self, task_id: TaskId, depth: usize) -> Result<TaskStatus, StoreError> {
        let rows = self.subtree_rows(task_id)?;
        status_tree(&rows, task_id, depth)
    }

    async fn register_submission(
        &self,
        experiment_id: ExperimentId,
        program: &str,
        user_name: &str,
    ) -> Result<SubmissionId, StoreError> {
        let id = self.next_submission_id.fetch_add(1, Ordering::SeqCst);
        self.submissions.write().insert(
            id,
            Submission {
                id,
                experiment_id,
                program: program.to_string(),
                user_name: user_name.to_string(),
                top_task_id: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn attach_root(
        &self,
        submission_id: SubmissionId,
        root_task_id: TaskId,
    ) -> Result<(), StoreError> {
        if !self.tasks.read().contains_key(&root_task_id) {
            return Err(StoreError::TaskNotFound(root_task_id));
        }
        let mut submissions = self.submissions.write();
        let submission = submissions
            .get_mut(&submission_id)
            .ok_or(StoreError::SubmissionNotFound(submission_id))?;
        submission.top_task_id = Some(root_task_id);
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Submission, StoreError> {
        self.submissions
            .read()
            .get(&submission_id)
            .cloned()
            .ok_or(StoreError::SubmissionNotFound(submission_id))
    }

    async fn most_recent_top_task(
        &self,
        experiment_id: ExperimentId,
        program: &str,
    ) -> Result<Option<TaskId>, StoreError> {
        let submissions = self.submissions.read();
        let latest = submissions
            .values()
            .filter(|s| s.experiment_id == experiment_id && s.program == program)
            .max_by_key(|s| s.id);
        Ok(latest.and_then(|s| s.top_task_id))
    }

    async fn delete_submission(&self, submission_id: SubmissionId) -> Result<(), StoreError> {
        let removed = self.submissions.write().remove(&submission_id);
        if removed.is_none() {
            return Err(StoreError::SubmissionNotFound(submission_id));
        }
        self.tasks
            .write()
            .retain(|_, row| row.submission_id != submission_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::Walltime;
    use mosaic_workflow::jobs::{JobSpec, PhaseSpec};
    use mosaic_workflow::task::{
        JobData, ResourceRequest, RunJob, RunJobCollection, TaskState,
    };
    use std::path::PathBuf;

    fn run_job(job_id: u32) -> Task {
        let spec = JobSpec {
            step_name: "probe".into(),
            experiment_id: 1,
            workflow_root: PathBuf::from("/tmp/workflow"),
            phase: PhaseSpec::Run { job_id, index: None },
            verbosity: 0,
        };
        Task::Run(RunJob {
            data: JobData::new(spec.job_name(), 1),
            job_id,
            index: None,
            spec,
            resources: ResourceRequest::new(Walltime::from_secs(600), 500, 1).unwrap(),
            handle: None,
        })
    }

    fn collection() -> Task {
        let mut collection = RunJobCollection::new("probe", 1, None);
        collection.tasks = vec![run_job(1), run_job(2)];
        Task::RunCollection(collection)
    }

    #[tokio::test]
    async fn test_save_assigns_monotonic_identities() {
        let store = InMemoryTaskStore::new();
        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();
        assert_eq!(root_id, 1);
        let children = task.children().unwrap();
        assert_eq!(children[0].data().persistent_id, Some(2));
        assert_eq!(children[1].data().persistent_id, Some(3));

        // Saving again is idempotent: no new identities, no new rows
        let again = store.save(&mut task).await.unwrap();
        assert_eq!(again, root_id);
        assert_eq!(store.task_count(), 3);
    }

    #[tokio::test]
    async fn test_load_reconstructs_structure_and_state() {
        let store = InMemoryTaskStore::new();
        let mut task = collection();
        if let Some(children) = task.children_mut() {
            children[1].data_mut().execution.state = TaskState::Terminated;
            children[1].data_mut().execution.exitcode = Some(4);
        }
        let root_id = store.save(&mut task).await.unwrap();
        store.update_accounting(&task).await.unwrap();

        let loaded = store.load(root_id).await.unwrap();
        assert_eq!(loaded.type_name(), "RunJobCollection");
        let children = loaded.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name(), "probe_run_000001");
        assert!(children[1].is_terminated());
        assert_eq!(children[1].exitcode(), Some(4));
        // The job spec survived the roundtrip through the payload column
        assert_eq!(
            children[0].job_spec().unwrap().phase,
            PhaseSpec::Run { job_id: 1, index: None }
        );
    }

    #[tokio::test]
    async fn test_structural_save_preserves_engine_accounting()  {
        let store = InMemoryTaskStore::new();
        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();

        // The engine records progress
        if let Some(children) = task.children_mut() {
            children[0].data_mut().execution.state = TaskState::Running;
        }
        store.update_accounting(&task).await.unwrap();

        // A stale structural save must not clobber the engine's view
        let mut stale = task.clone();
        if let Some(children) = stale.children_mut() {
            children[0].data_mut().execution.reset();
        }
        store.save(&mut stale).await.unwrap();

        let loaded = store.load(root_id).await.unwrap();
        assert!(loaded.children().unwrap()[0].is_running());
    }

    #[tokio::test]
    async fn test_replaced_children_are_not_reattached() {
        let store = InMemoryTaskStore::new();
        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();
        let replaced_id = task.children().unwrap()[1].data().persistent_id;

        // The driver swaps the second child for a fresh, unsaved task
        task.replace_child(1, run_job(9));
        store.save(&mut task).await.unwrap();

        let loaded = store.load(root_id).await.unwrap();
        let children = loaded.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].name(), "probe_run_000009");
        assert_ne!(children[1].data().persistent_id, replaced_id);
        assert_eq!(store.task_count(), 3);
    }

    #[tokio::test]
    async fn test_submission_registry_roundtrip() {
        let store = InMemoryTaskStore::new();
        let submission_id = store.register_submission(7, "workflow", "anna").await.unwrap();
        let submission = store.get_submission(submission_id).await.unwrap();
        assert_eq!(submission.experiment_id, 7);
        assert!(submission.top_task_id.is_none());

        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();
        store.attach_root(submission_id, root_id).await.unwrap();
        assert_eq!(
            store.most_recent_top_task(7, "workflow").await.unwrap(),
            Some(root_id)
        );
        assert_eq!(store.most_recent_top_task(7, "tiler").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_most_recent_submission_wins() {
        let store = InMemoryTaskStore::new();
        for _ in 0..2 {
            let submission_id = store.register_submission(7, "workflow", "anna").await.unwrap();
            let mut task = collection();
            let root_id = store.save(&mut task).await.unwrap();
            store.attach_root(submission_id, root_id).await.unwrap();
        }
        // Two submissions; the later one owns tasks 4..6
        assert_eq!(store.most_recent_top_task(7, "workflow").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_delete_submission_removes_tree() {
        let store = InMemoryTaskStore::new();
        let submission_id = store.register_submission(7, "workflow", "anna").await.unwrap();
        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();
        store.attach_root(submission_id, root_id).await.unwrap();

        store.delete_submission(submission_id).await.unwrap();
        assert_eq!(store.task_count(), 0);
        assert!(matches!(
            store.load(root_id).await,
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_snapshot_depth_truncation() {
        let store = InMemoryTaskStore::new();
        let mut task = collection();
        let root_id = store.save(&mut task).await.unwrap();

        let shallow = store.task_status(root_id, 0).await.unwrap();
        assert!(shallow.subtasks.is_empty());
        assert_eq!(shallow.state_counts["NEW"], 3);

        let deep = store.task_status(root_id, 1).await.unwrap();
        assert_eq!(deep.subtasks.len(), 2);
    }
}
