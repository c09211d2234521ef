//! The `TaskStore` trait and its error type.
//!
//! The store is the single mutable shared resource of the orchestrator.
//! Drivers write structural columns (parent links, child ordinals, node
//! payloads) through [`TaskStore::save`]; the engine writes accounting
//! columns (state, return code, timings, memory) through
//! [`TaskStore::update_accounting`]. The two column sets are disjoint, so a
//! structural save can never clobber the engine's view of a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mosaic_core::{ExperimentId, SubmissionId, TaskId};
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::task::Task;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Submission not found
    #[error("submission not found: {0}")]
    SubmissionNotFound(SubmissionId),

    /// A child row references a parent that does not exist
    #[error("task {task} references missing parent {parent}")]
    MissingParent { task: TaskId, parent: TaskId },

    /// The subtype tag of a row is not a known task kind
    #[error("unknown task type \"{0}\"")]
    UnknownTaskType(String),

    /// A task must be saved before the requested operation
    #[error("task \"{0}\" has no identity yet; save it first")]
    Unsaved(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Node payload (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A user-initiated attempt to process an experiment with a named program
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub experiment_id: ExperimentId,
    pub program: String,
    pub user_name: String,

    /// Root task of the submission; attached after the first save
    pub top_task_id: Option<TaskId>,

    pub created_at: DateTime<Utc>,
}

/// Store for tasks and submissions
///
/// Implementations must be thread-safe; all engine calls are serialized by
/// the adapter, but the HTTP status server may query concurrently.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Task operations
    // =========================================================================

    /// Persist the subtree rooted at `task`
    ///
    /// Tasks without an identity are assigned one and inserted; existing
    /// tasks get their structural columns updated. Children are saved
    /// recursively with their ordinal within the parent. Idempotent.
    async fn save(&self, task: &mut Task) -> Result<TaskId, StoreError>;

    /// Load the subtree rooted at `task_id`
    ///
    /// Concrete subtypes are reconstructed from the tag column; children
    /// are attached in ordinal order.
    async fn load(&self, task_id: TaskId) -> Result<Task, StoreError>;

    /// Write the accounting columns of every saved task in the subtree
    ///
    /// This is the engine's per-tick partial update; structural columns
    /// are untouched. Unsaved tasks are skipped.
    async fn update_accounting(&self, task: &Task) -> Result<(), StoreError>;

    /// Build a recursive status snapshot of the subtree rooted at `task_id`
    ///
    /// Subtrees deeper than `depth` are summarized by state counts only.
    async fn task_status(&self, task_id: TaskId, depth: usize) -> Result<TaskStatus, StoreError>;

    // =========================================================================
    // Submission registry
    // =========================================================================

    /// Insert a submission with no root task yet and return its id
    async fn register_submission(
        &self,
        experiment_id: ExperimentId,
        program: &str,
        user_name: &str,
    ) -> Result<SubmissionId, StoreError>;

    /// Attach the root task after the first save produced an identity
    async fn attach_root(
        &self,
        submission_id: SubmissionId,
        root_task_id: TaskId,
    ) -> Result<(), StoreError>;

    /// Fetch one submission
    async fn get_submission(&self, submission_id: SubmissionId)
        -> Result<Submission, StoreError>;

    /// Root task of the most recent submission for (experiment, program)
    async fn most_recent_top_task(
        &self,
        experiment_id: ExperimentId,
        program: &str,
    ) -> Result<Option<TaskId>, StoreError>;

    /// Delete a submission and its entire task tree
    async fn delete_submission(&self, submission_id: SubmissionId) -> Result<(), StoreError>;
}
