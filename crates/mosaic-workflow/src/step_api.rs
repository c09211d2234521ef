//! The contract every workflow step implements, and the process-wide
//! registries that map description names to implementations.
//!
//! Steps are registered once at program start (compile-time registration);
//! neither registry is mutated afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mosaic_core::{ExperimentId, Walltime, WorkflowError};

use crate::batches::{BatchSet, CollectBatch, RunBatch, StepLayout};
use crate::jobs::ArgMap;

/// Resource allocation for the jobs of a run phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionArgs {
    /// Walltime per job, `HH:MM:SS`
    pub duration: Walltime,

    /// Memory per job in MB
    pub memory: u64,

    /// CPU cores per job
    pub cores: u32,
}

impl SubmissionArgs {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.memory == 0 {
            return Err(WorkflowError::description(
                "submission argument \"memory\" must be a positive integer",
            ));
        }
        if self.cores == 0 {
            return Err(WorkflowError::description(
                "submission argument \"cores\" must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Declared batch or extra argument of a step
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub required: bool,
    pub help: &'static str,
}

impl ArgSpec {
    pub const fn required(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            required: true,
            help,
        }
    }

    pub const fn optional(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            required: false,
            help,
        }
    }
}

/// Execution context handed to a step implementation
///
/// Carries everything a phase needs to locate its data; the step never
/// talks to the scheduler or the task store.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub experiment_id: ExperimentId,
    pub workflow_root: PathBuf,
    pub layout: StepLayout,
    pub verbosity: u8,
    pub extra_args: ArgMap,
}

impl StepContext {
    pub fn new(
        experiment_id: ExperimentId,
        workflow_root: impl Into<PathBuf>,
        step_name: &str,
        verbosity: u8,
        extra_args: ArgMap,
    ) -> Self {
        let workflow_root = workflow_root.into();
        Self {
            layout: StepLayout::new(&workflow_root, step_name),
            experiment_id,
            workflow_root,
            verbosity,
            extra_args,
        }
    }
}

/// A workflow step implementation
///
/// The scheduler knows nothing about a step beyond this trait: `init`
/// partitions the work into batches, `run` processes one batch on a worker
/// node, and steps that post-process their run output opt into a collect
/// phase via [`StepApi::has_collect_phase`].
#[async_trait]
pub trait StepApi: Send + Sync {
    /// Registry name of the step
    fn name(&self) -> &'static str;

    /// Whether the step has a collect phase
    fn has_collect_phase(&self) -> bool {
        false
    }

    /// Batch arguments the step accepts
    fn batch_arg_specs(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    /// Extra constructor arguments the step accepts
    fn extra_arg_specs(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    /// Default resource allocation for the run phase
    fn default_submission_args(&self) -> SubmissionArgs {
        SubmissionArgs {
            duration: Walltime::from_secs(2 * 3600),
            memory: 2000,
            cores: 1,
        }
    }

    /// Remove persisted per-job artifacts of a previous submission
    ///
    /// Called by the init phase before new batches are written.
    async fn delete_previous_job_output(&self, ctx: &StepContext) -> Result<(), WorkflowError>;

    /// Partition the work into run batches (and at most one collect batch)
    async fn create_run_batches(
        &self,
        ctx: &StepContext,
        batch_args: &ArgMap,
    ) -> Result<BatchSet, WorkflowError>;

    /// Process one batch to completion on a worker node
    ///
    /// Must be idempotent when `assume_clean_state` is false.
    async fn run_job(
        &self,
        ctx: &StepContext,
        batch: &RunBatch,
        assume_clean_state: bool,
    ) -> Result<(), WorkflowError>;

    /// Post-process the output of all run jobs
    ///
    /// Only called when [`StepApi::has_collect_phase`] is true.
    async fn collect_job_output(
        &self,
        ctx: &StepContext,
        batch: &CollectBatch,
    ) -> Result<(), WorkflowError> {
        let _ = (ctx, batch);
        Err(WorkflowError::transition(format!(
            "step \"{}\" has no collect phase",
            self.name()
        )))
    }
}

/// Name-keyed registry of step implementations
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn StepApi>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Register a step implementation under its declared name
    pub fn register(&mut self, step: Arc<dyn StepApi>) {
        tracing::debug!(step = step.name(), "register step");
        self.steps.insert(step.name().to_string(), step);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Look up a step implementation
    pub fn get(&self, name: &str) -> Result<Arc<dyn StepApi>, WorkflowError> {
        self.steps.get(name).cloned().ok_or_else(|| {
            WorkflowError::description(format!("\"{name}\" is not a registered step name"))
        })
    }

    /// Names of all registered steps, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}

/// Declaration of a workflow type: which stages a description of this type
/// may contain and how they are validated
pub trait WorkflowDependencies: Send + Sync {
    /// Registry name of the workflow type
    fn type_name(&self) -> &'static str;

    /// Validate the structure of a description of this type
    ///
    /// Step-level argument validation has already happened; this hook
    /// checks stage order and composition constraints.
    fn validate(
        &self,
        description: &crate::description::WorkflowDescription,
        steps: &StepRegistry,
    ) -> Result<(), WorkflowError>;
}

/// Workflow type that accepts any composition of registered steps
pub struct CustomWorkflowType;

impl WorkflowDependencies for CustomWorkflowType {
    fn type_name(&self) -> &'static str {
        "custom"
    }

    fn validate(
        &self,
        description: &crate::description::WorkflowDescription,
        steps: &StepRegistry,
    ) -> Result<(), WorkflowError> {
        for stage in &description.stages {
            for step in &stage.steps {
                if !steps.contains(&step.name) {
                    return Err(WorkflowError::description(format!(
                        "unknown step \"{}\" in stage \"{}\"",
                        step.name, stage.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Name-keyed registry of workflow types
pub struct WorkflowTypeRegistry {
    types: HashMap<String, Arc<dyn WorkflowDependencies>>,
}

impl WorkflowTypeRegistry {
    /// Create a registry containing the built-in `custom` type
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        registry.register(Arc::new(CustomWorkflowType));
        registry
    }

    pub fn register(&mut self, workflow_type: Arc<dyn WorkflowDependencies>) {
        self.types
            .insert(workflow_type.type_name().to_string(), workflow_type);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn WorkflowDependencies>, WorkflowError> {
        self.types.get(name).cloned().ok_or_else(|| {
            WorkflowError::description(format!("\"{name}\" is not a registered workflow type"))
        })
    }
}

impl Default for WorkflowTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
