//! In-process backend: runs phases directly on the tokio runtime.
//!
//! Used by embedded deployments and the test suite; cluster deployments use
//! the process-spawning [`crate::LocalBackend`] (or a scheduler-specific
//! adapter) instead. Log files are written the same way as for external
//! jobs so failure reporting works identically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use mosaic_core::WorkflowError;
use mosaic_workflow::jobs::{log_file_names, JobSpec};
use mosaic_workflow::phase::execute_phase;
use mosaic_workflow::step_api::StepRegistry;
use mosaic_workflow::task::ResourceRequest;

use crate::backend::{BackendJobState, ClusterBackend, JobAccounting};
use crate::EngineError;

/// Exit code reported for cancelled jobs
pub const CANCELLED_EXITCODE: i32 = 130;

struct JobEntry {
    spec: JobSpec,
    started: Instant,
    timestamp: String,
    handle: Option<tokio::task::JoinHandle<Result<(), WorkflowError>>>,
    outcome: Option<BackendJobState>,
}

/// Backend executing phases in-process via the step registry
pub struct InProcessBackend {
    registry: Arc<StepRegistry>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    next_id: AtomicU64,
}

impl InProcessBackend {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn write_logs(entry: &JobEntry, stdout: &str, stderr: &str) {
        let log_location = entry.spec.log_location();
        if std::fs::create_dir_all(&log_location).is_err() {
            return;
        }
        let (out_name, err_name) = log_file_names(&entry.spec.job_name(), &entry.timestamp);
        let _ = std::fs::write(log_location.join(out_name), stdout);
        let _ = std::fs::write(log_location.join(err_name), stderr);
    }

    async fn resolve(entry: &mut JobEntry) -> BackendJobState {
        let Some(handle) = entry.handle.take() else {
            // Unreachable while an outcome is cached
            return BackendJobState::Running;
        };
        let accounting = JobAccounting {
            duration_secs: Some(entry.started.elapsed().as_secs_f64()),
            max_memory_mb: None,
            cpu_time_secs: None,
        };
        let state = match handle.await {
            Ok(Ok(())) => {
                Self::write_logs(entry, "job terminated successfully\n", "");
                BackendJobState::Terminated {
                    exitcode: 0,
                    accounting,
                }
            }
            Ok(Err(error)) => {
                Self::write_logs(entry, "", &format!("{error}\n"));
                BackendJobState::Terminated {
                    exitcode: 1,
                    accounting,
                }
            }
            Err(join_error) if join_error.is_cancelled() => {
                Self::write_logs(entry, "", "job was cancelled\n");
                BackendJobState::Stopped {
                    exitcode: Some(CANCELLED_EXITCODE),
                    accounting,
                }
            }
            Err(join_error) => {
                Self::write_logs(entry, "", &format!("job panicked: {join_error}\n"));
                BackendJobState::Terminated {
                    exitcode: 1,
                    accounting,
                }
            }
        };
        entry.outcome = Some(state.clone());
        state
    }
}

#[async_trait]
impl ClusterBackend for InProcessBackend {
    async fn submit(
        &self,
        spec: &JobSpec,
        _resources: &ResourceRequest,
    ) -> Result<String, EngineError> {
        let handle_id = format!("inproc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let registry = self.registry.clone();
        let job_spec = spec.clone();
        let join = tokio::spawn(async move { execute_phase(&registry, &job_spec).await });
        debug!(job = %spec.job_name(), handle = %handle_id, "spawned in-process job");
        self.jobs.lock().await.insert(
            handle_id.clone(),
            JobEntry {
                spec: spec.clone(),
                started: Instant::now(),
                timestamp: chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
                handle: Some(join),
                outcome: None,
            },
        );
        Ok(handle_id)
    }

    async fn status(&self, handle: &str) -> Result<BackendJobState, EngineError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        if let Some(outcome) = &entry.outcome {
            return Ok(outcome.clone());
        }
        let finished = entry
            .handle
            .as_ref()
            .is_some_and(tokio::task::JoinHandle::is_finished);
        if finished {
            Ok(Self::resolve(entry).await)
        } else {
            Ok(BackendJobState::Running)
        }
    }

    async fn cancel(&self, handle: &str) -> Result<(), EngineError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs
            .get(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        if let Some(join) = &entry.handle {
            join.abort();
        }
        Ok(())
    }
}
