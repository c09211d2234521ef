//! Execution record and resource request attached to every task.

use serde::{Deserialize, Serialize};

use mosaic_core::{Walltime, WorkflowError};

/// Lifecycle state of a task
///
/// States progress monotonically: `NEW → SUBMITTED → RUNNING →
/// (STOPPED | TERMINATED)`. Collections derive their state from their
/// children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Submitted,
    Running,
    Stopped,
    Terminated,
}

impl TaskState {
    /// Parse a state from its column representation
    pub fn parse(value: &str) -> Result<Self, WorkflowError> {
        match value {
            "NEW" => Ok(Self::New),
            "SUBMITTED" => Ok(Self::Submitted),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "TERMINATED" => Ok(Self::Terminated),
            other => Err(WorkflowError::DataIntegrity(format!(
                "unknown task state \"{other}\""
            ))),
        }
    }

    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Per-task execution record
///
/// The engine is the only writer of these fields once a task has been
/// submitted; drivers only reset them on `redo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Current lifecycle state
    pub state: TaskState,

    /// Return code; `None` until the task terminated
    pub exitcode: Option<i32>,

    /// Maximum resident memory observed, in MB
    pub max_used_memory_mb: Option<f64>,

    /// CPU time consumed, in seconds
    pub used_cpu_time_secs: Option<f64>,

    /// Wall-clock duration, in seconds
    pub duration_secs: Option<f64>,
}

impl Execution {
    pub fn new() -> Self {
        Self {
            state: TaskState::New,
            exitcode: None,
            max_used_memory_mb: None,
            used_cpu_time_secs: None,
            duration_secs: None,
        }
    }

    /// Reset to the initial record so the next engine tick resubmits
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Execution {
    fn default() -> Self {
        Self::new()
    }
}

/// Resources requested for a single cluster job
///
/// Set before the task is added to the engine; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Requested walltime
    pub walltime: Walltime,

    /// Requested memory in MB
    pub memory_mb: u64,

    /// Requested CPU cores
    pub cores: u32,
}

impl ResourceRequest {
    /// Create a validated resource request
    pub fn new(walltime: Walltime, memory_mb: u64, cores: u32) -> Result<Self, WorkflowError> {
        if cores == 0 {
            return Err(WorkflowError::description(
                "the number of requested cores must be positive",
            ));
        }
        if memory_mb == 0 {
            return Err(WorkflowError::description(
                "the amount of requested memory must be positive",
            ));
        }
        Ok(Self {
            walltime,
            memory_mb,
            cores,
        })
    }
}
