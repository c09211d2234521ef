//! User-facing workflow description, consumed as YAML at submission.
//!
//! A description names a workflow type and a sequence of stages, each
//! composed of steps with per-step batch, submission and extra arguments.
//! Validation happens synchronously at submit time; an invalid description
//! never creates a submission.

use serde::{Deserialize, Serialize};

use mosaic_core::WorkflowError;

use crate::jobs::ArgMap;
use crate::step_api::{ArgSpec, StepRegistry, SubmissionArgs, WorkflowTypeRegistry};

/// How the steps of a stage are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    /// Steps run one after another; each step's batches may depend on the
    /// previous step's output
    Sequential,

    /// Steps are initialized up front and run concurrently
    Parallel,
}

impl std::fmt::Display for StageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Description of a single step within a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescription {
    /// Name of the step in the step registry
    pub name: String,

    /// Inactive steps are dropped when the workflow is built
    #[serde(default = "default_active")]
    pub active: bool,

    /// Arguments controlling how the step partitions its work
    #[serde(default)]
    pub batch_args: ArgMap,

    /// Per-job resource requests for the run phase; step defaults apply
    /// when omitted
    #[serde(default)]
    pub submission_args: Option<SubmissionArgs>,

    /// Step-specific constructor arguments
    #[serde(default)]
    pub extra_args: ArgMap,
}

impl StepDescription {
    /// Resolved submission arguments
    ///
    /// Only valid after [`WorkflowDescription::validate`] filled defaults.
    pub fn submission_args(&self) -> &SubmissionArgs {
        self.submission_args
            .as_ref()
            .expect("submission args are resolved during description validation")
    }
}

/// Description of a workflow stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescription {
    pub name: String,

    /// Inactive stages are dropped when the workflow is built
    #[serde(default = "default_active")]
    pub active: bool,

    pub mode: StageMode,

    pub steps: Vec<StepDescription>,
}

/// Description of a complete workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDescription {
    /// Name of the workflow type in the type registry
    #[serde(rename = "type")]
    pub workflow_type: String,

    pub stages: Vec<StageDescription>,
}

fn default_active() -> bool {
    true
}

impl WorkflowDescription {
    /// Parse a description from its YAML representation
    pub fn from_yaml(contents: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(contents)
            .map_err(|e| WorkflowError::description(format!("malformed description: {e}")))
    }

    /// Serialize the description to YAML
    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml::to_string(self)
            .map_err(|e| WorkflowError::description(format!("cannot serialize description: {e}")))
    }

    /// Mark every stage and step active (the `--force` submission path)
    pub fn activate_all(&mut self) {
        for stage in &mut self.stages {
            stage.active = true;
            for step in &mut stage.steps {
                step.active = true;
            }
        }
    }

    /// Validate the description against the registries and fill defaults
    ///
    /// Checks stage composition, resolves every step name, verifies batch
    /// and extra argument keys against the step's declared schema, fills
    /// omitted submission arguments with the step's defaults, and finally
    /// lets the workflow type validate the overall structure.
    pub fn validate(
        &mut self,
        steps: &StepRegistry,
        types: &WorkflowTypeRegistry,
    ) -> Result<(), WorkflowError> {
        let workflow_type = types.get(&self.workflow_type)?;
        for stage in &mut self.stages {
            if stage.steps.is_empty() {
                return Err(WorkflowError::description(format!(
                    "stage \"{}\" must contain at least one step",
                    stage.name
                )));
            }
            for step in &mut stage.steps {
                let api = steps.get(&step.name)?;
                check_arg_keys(&step.name, "batch", &step.batch_args, &api.batch_arg_specs())?;
                check_arg_keys(&step.name, "extra", &step.extra_args, &api.extra_arg_specs())?;
                let args = step
                    .submission_args
                    .get_or_insert_with(|| api.default_submission_args());
                args.validate()?;
            }
        }
        workflow_type.validate(self, steps)
    }
}

fn check_arg_keys(
    step_name: &str,
    kind: &str,
    provided: &ArgMap,
    specs: &[ArgSpec],
) -> Result<(), WorkflowError> {
    for key in provided.keys() {
        if !specs.iter().any(|spec| spec.name == key) {
            return Err(WorkflowError::description(format!(
                "unknown {kind} argument \"{key}\" for step \"{step_name}\""
            )));
        }
    }
    for spec in specs {
        if spec.required && !provided.contains_key(spec.name) {
            return Err(WorkflowError::description(format!(
                "required {kind} argument \"{}\" missing for step \"{step_name}\"",
                spec.name
            )));
        }
    }
    Ok(())
}
