//! # Mosaic execution engine
//!
//! The adapter between the task tree and whatever runs jobs: a
//! [`ClusterBackend`] executes individual [`mosaic_workflow::JobSpec`]s,
//! the [`Engine`] drives state transitions one `progress()` tick at a
//! time, and [`monitor::submit_and_monitor`] is the cooperative loop the
//! manager runs until a submission terminates.

pub mod backend;
pub mod engine;
pub mod inprocess;
pub mod local;
pub mod monitor;

pub use backend::{BackendJobState, ClusterBackend, JobAccounting};
pub use engine::{Engine, EngineLimits};
pub use inprocess::InProcessBackend;
pub use local::LocalBackend;
pub use monitor::{submit_and_monitor, MonitorOptions};

use mosaic_core::TaskId;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Cluster backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// A status or cancel call referenced a job the backend does not know
    #[error("unknown job handle: {0}")]
    UnknownHandle(String),

    /// The referenced task is not under engine management
    #[error("task {0} is not managed by the engine")]
    UnknownTask(TaskId),

    /// Tasks must be saved before they are added to the engine
    #[error("task \"{0}\" has no identity yet; save it first")]
    Unsaved(String),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] mosaic_storage::StoreError),

    /// Driver failure surfaced outside a transition
    #[error(transparent)]
    Workflow(#[from] mosaic_core::WorkflowError),
}
