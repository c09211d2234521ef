//! # Mosaic workflow model
//!
//! The task hierarchy of a Mosaic pipeline and the drivers that build and
//! advance it:
//!
//! ```text
//! Workflow ──► Stage[*] ──► Step ──► {InitJob, RunJobCollection, CollectJob}
//! ```
//!
//! A [`driver::Workflow`] is built from a user-supplied
//! [`description::WorkflowDescription`]; each [`driver::WorkflowStep`]
//! composes up to three phases, where the run fan-out is generated
//! dynamically from the batch files the init phase wrote. Step semantics
//! live behind the [`step_api::StepApi`] contract; the scheduler never
//! looks inside a step.

pub mod batches;
pub mod description;
pub mod driver;
pub mod jobs;
pub mod phase;
pub mod snapshot;
pub mod step_api;
pub mod task;

pub use batches::{BatchSet, CollectBatch, RunBatch, StepLayout};
pub use description::{StageDescription, StageMode, StepDescription, WorkflowDescription};
pub use driver::{ParallelStage, SequentialStage, Workflow, WorkflowContext, WorkflowStep};
pub use jobs::{ArgMap, JobSpec, PhaseSpec};
pub use phase::execute_phase;
pub use snapshot::TaskStatus;
pub use step_api::{
    ArgSpec, StepApi, StepContext, StepRegistry, SubmissionArgs, WorkflowDependencies,
    WorkflowTypeRegistry,
};
pub use task::{
    aggregate_state, CollectJob, Execution, InitJob, JobData, MultiRunJobCollection,
    ResourceRequest, RunJob, RunJobCollection, Task, TaskState,
};
