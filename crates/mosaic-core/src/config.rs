//! Process configuration resolved from the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the orchestrator process
///
/// Values are read once at startup from the environment (a `.env` file is
/// honored when present); command-line flags override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection string for the tasks/submissions database
    pub database_url: String,

    /// Base directory under which per-experiment workflow data lives
    pub workflow_root: PathBuf,

    /// Seconds between monitoring iterations
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,

    /// Recursion depth for status snapshots
    #[serde(default = "default_monitoring_depth")]
    pub monitoring_depth: usize,

    /// Upper bound on simultaneously submitted cluster jobs
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_monitoring_interval() -> u64 {
    10
}

fn default_monitoring_depth() -> usize {
    2
}

fn default_max_in_flight() -> usize {
    2000
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Reads `MOSAIC_DATABASE_URL` (falling back to `DATABASE_URL`) and
    /// `MOSAIC_WORKFLOW_ROOT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let database_url = std::env::var("MOSAIC_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingVar("MOSAIC_DATABASE_URL"))?;
        let workflow_root = std::env::var("MOSAIC_WORKFLOW_ROOT")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingVar("MOSAIC_WORKFLOW_ROOT"))?;
        Ok(Self {
            database_url,
            workflow_root,
            monitoring_interval: default_monitoring_interval(),
            monitoring_depth: default_monitoring_depth(),
            max_in_flight: default_max_in_flight(),
        })
    }

    /// Workflow directory of a single experiment
    pub fn experiment_workflow_root(&self, experiment_id: i64) -> PathBuf {
        self.workflow_root
            .join(format!("experiment_{experiment_id}"))
            .join("workflow")
    }
}

/// Errors raised while resolving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is not set
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
}
