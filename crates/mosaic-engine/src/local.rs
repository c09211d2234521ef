//! Local process backend: one OS process per job on this machine.
//!
//! The reference binding for shell execution. Each job spawns the
//! `mosaic exec` entry point with the job's phase arguments; stdout and
//! stderr are redirected to the step's log directory following the
//! platform-wide naming scheme. Scheduler bindings (SLURM, PBS) wrap the
//! same argument vector in a batch script instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

use mosaic_workflow::jobs::{log_file_names, JobSpec};
use mosaic_workflow::task::ResourceRequest;

use crate::backend::{BackendJobState, ClusterBackend, JobAccounting};
use crate::inprocess::CANCELLED_EXITCODE;
use crate::EngineError;

struct ProcessEntry {
    child: Child,
    started: Instant,
    cancelled: bool,
}

/// Backend spawning worker processes on the local machine
pub struct LocalBackend {
    /// Program to execute; defaults to the current executable
    program: PathBuf,
    processes: Mutex<HashMap<String, ProcessEntry>>,
    next_id: AtomicU64,
}

impl LocalBackend {
    /// Create a backend that re-invokes the current executable
    pub fn new() -> Result<Self, EngineError> {
        let program = std::env::current_exe()
            .map_err(|e| EngineError::Backend(format!("cannot locate own executable: {e}")))?;
        Ok(Self::with_program(program))
    }

    /// Create a backend spawning the given program
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            processes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ClusterBackend for LocalBackend {
    async fn submit(
        &self,
        spec: &JobSpec,
        _resources: &ResourceRequest,
    ) -> Result<String, EngineError> {
        let log_location = spec.log_location();
        std::fs::create_dir_all(&log_location)
            .map_err(|e| EngineError::Backend(format!("cannot create log directory: {e}")))?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let (out_name, err_name) = log_file_names(&spec.job_name(), &timestamp);
        let stdout = std::fs::File::create(log_location.join(out_name))
            .map_err(|e| EngineError::Backend(format!("cannot create stdout log: {e}")))?;
        let stderr = std::fs::File::create(log_location.join(err_name))
            .map_err(|e| EngineError::Backend(format!("cannot create stderr log: {e}")))?;

        let child = Command::new(&self.program)
            .args(spec.to_exec_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| EngineError::Backend(format!("cannot spawn worker process: {e}")))?;

        let handle = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(job = %spec.job_name(), handle = %handle, "spawned worker process");
        self.processes.lock().await.insert(
            handle.clone(),
            ProcessEntry {
                child,
                started: Instant::now(),
                cancelled: false,
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: &str) -> Result<BackendJobState, EngineError> {
        let mut processes = self.processes.lock().await;
        let entry = processes
            .get_mut(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        let status = entry
            .child
            .try_wait()
            .map_err(|e| EngineError::Backend(format!("cannot poll worker process: {e}")))?;
        match status {
            None => Ok(BackendJobState::Running),
            Some(status) => {
                let accounting = JobAccounting {
                    duration_secs: Some(entry.started.elapsed().as_secs_f64()),
                    max_memory_mb: None,
                    cpu_time_secs: None,
                };
                if entry.cancelled {
                    Ok(BackendJobState::Stopped {
                        exitcode: Some(status.code().unwrap_or(CANCELLED_EXITCODE)),
                        accounting,
                    })
                } else {
                    // A killed process has no exit code; report the signal
                    // convention instead.
                    Ok(BackendJobState::Terminated {
                        exitcode: status.code().unwrap_or(CANCELLED_EXITCODE),
                        accounting,
                    })
                }
            }
        }
    }

    async fn cancel(&self, handle: &str) -> Result<(), EngineError> {
        let mut processes = self.processes.lock().await;
        let entry = processes
            .get_mut(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.to_string()))?;
        entry.cancelled = true;
        entry
            .child
            .start_kill()
            .map_err(|e| EngineError::Backend(format!("cannot kill worker process: {e}")))
    }
}
