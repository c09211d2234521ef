//! The seam between the engine and whatever actually runs jobs.
//!
//! A backend accepts a [`JobSpec`] with its resource request, hands back an
//! opaque handle, and answers status polls until the physical job reaches a
//! terminal state. The engine guarantees at most one concurrent physical
//! job per leaf task.

use async_trait::async_trait;

use mosaic_workflow::jobs::JobSpec;
use mosaic_workflow::task::ResourceRequest;

use crate::EngineError;

/// Resource usage reported for a finished job
#[derive(Debug, Clone, Default)]
pub struct JobAccounting {
    /// Wall-clock duration in seconds
    pub duration_secs: Option<f64>,

    /// Maximum resident memory in MB
    pub max_memory_mb: Option<f64>,

    /// CPU time in seconds
    pub cpu_time_secs: Option<f64>,
}

/// State of a physical job as reported by the backend
#[derive(Debug, Clone)]
pub enum BackendJobState {
    /// Accepted by the scheduler, not yet running
    Submitted,

    /// Executing on a worker node
    Running,

    /// Finished; `exitcode` 0 means success
    Terminated {
        exitcode: i32,
        accounting: JobAccounting,
    },

    /// Cancelled before completion
    Stopped {
        exitcode: Option<i32>,
        accounting: JobAccounting,
    },
}

/// Adapter over a cluster scheduler (or an in-process executor)
#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    /// Start a physical job for `spec` and return its handle
    async fn submit(
        &self,
        spec: &JobSpec,
        resources: &ResourceRequest,
    ) -> Result<String, EngineError>;

    /// Report the current state of the job behind `handle`
    async fn status(&self, handle: &str) -> Result<BackendJobState, EngineError>;

    /// Request cancellation; the next status poll reports a terminal state
    async fn cancel(&self, handle: &str) -> Result<(), EngineError>;
}
