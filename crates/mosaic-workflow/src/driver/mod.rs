//! Drivers that build and advance the task tree.
//!
//! A driver owns the transition logic of one level of the hierarchy:
//! [`WorkflowStep`] composes the three phases of a step, the stage drivers
//! compose steps, and [`Workflow`] composes stages. Drivers are called
//! synchronously by the engine between scheduling ticks.

mod stage;
mod step;
mod workflow;

pub use stage::{ParallelStage, SequentialStage};
pub use step::WorkflowStep;
pub use workflow::Workflow;

use std::path::PathBuf;
use std::sync::Arc;

use mosaic_core::ExperimentId;

use crate::step_api::StepRegistry;

/// Everything a driver needs to build jobs for its children
#[derive(Clone)]
pub struct WorkflowContext {
    /// Step implementations, looked up by description name
    pub registry: Arc<StepRegistry>,

    /// Experiment being processed
    pub experiment_id: ExperimentId,

    /// Root directory of the experiment's workflow data
    pub workflow_root: PathBuf,

    /// Name of the submitting user
    pub user_name: String,

    /// Logging verbosity forwarded to worker jobs
    pub verbosity: u8,
}

impl WorkflowContext {
    pub fn new(
        registry: Arc<StepRegistry>,
        experiment_id: ExperimentId,
        workflow_root: impl Into<PathBuf>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            experiment_id,
            workflow_root: workflow_root.into(),
            user_name: user_name.into(),
            verbosity: 0,
        }
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
}
