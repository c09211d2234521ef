//! The workflow driver: sequential composition over stages.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mosaic_core::{SubmissionId, WorkflowError};

use crate::description::{StageDescription, StageMode, WorkflowDescription};
use crate::task::{JobData, Task, TaskState};

use super::{ParallelStage, SequentialStage, WorkflowContext};

/// A workflow: a computational pipeline processing one stage after another
///
/// The description handed in at construction is deep-copied and stripped of
/// inactive stages and steps; the filtered copy is authoritative for the
/// rest of the submission. All stages are built up front, but only the
/// first stage's first step is initialized before the first engine tick;
/// later stages advance lazily through `next`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub data: JobData,
    pub description: WorkflowDescription,

    /// Zero-based index of the stage currently being processed
    pub current: usize,

    /// Seconds to wait upon stage transitions (shared filesystem slack)
    pub waiting_time_secs: u64,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl Workflow {
    /// Build a workflow from a validated description
    ///
    /// The caller must invoke [`Workflow::start`] afterwards to initialize
    /// the first stage.
    pub fn new(
        name: impl Into<String>,
        submission_id: SubmissionId,
        description: &WorkflowDescription,
        waiting_time_secs: u64,
    ) -> Self {
        let mut workflow = Self {
            data: JobData::new(name, submission_id),
            description: WorkflowDescription {
                workflow_type: description.workflow_type.clone(),
                stages: Vec::new(),
            },
            current: 0,
            waiting_time_secs,
            tasks: Vec::new(),
        };
        workflow.update_description(description);
        let stages: Vec<Task> = workflow
            .description
            .stages
            .iter()
            .cloned()
            .map(|stage| workflow.build_stage(stage))
            .collect();
        workflow.tasks = stages;
        workflow
    }

    /// Replace the workflow description with a filtered deep copy
    ///
    /// Inactive stages and steps are dropped; they are never created nor
    /// persisted.
    pub fn update_description(&mut self, description: &WorkflowDescription) {
        info!("update workflow description");
        let mut filtered = description.clone();
        filtered.stages.retain(|stage| {
            if !stage.active {
                debug!(stage = %stage.name, "ignore inactive stage");
            }
            stage.active
        });
        for stage in &mut filtered.stages {
            stage.steps.retain(|step| {
                if !step.active {
                    debug!(step = %step.name, "ignore inactive step");
                }
                step.active
            });
        }
        self.description = filtered;
    }

    fn build_stage(&self, description: StageDescription) -> Task {
        match description.mode {
            StageMode::Sequential => {
                debug!(stage = %description.name, "build sequential workflow stage");
                Task::SequentialStage(SequentialStage::new(
                    description,
                    self.data.submission_id,
                    self.waiting_time_secs,
                ))
            }
            StageMode::Parallel => {
                debug!(stage = %description.name, "build parallel workflow stage");
                Task::ParallelStage(ParallelStage::new(description, self.data.submission_id))
            }
        }
    }

    /// Number of active stages
    pub fn n_stages(&self) -> usize {
        self.description.stages.len()
    }

    /// Zero-based index of the stage with the given name
    pub fn stage_index(&self, name: &str) -> Result<usize, WorkflowError> {
        self.description
            .stages
            .iter()
            .position(|stage| stage.name == name)
            .ok_or_else(|| WorkflowError::description(format!("unknown stage \"{name}\"")))
    }

    /// Initialize the first stage so the workflow can be submitted
    pub fn start(&mut self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        self.update_stage(0, ctx)
    }

    /// (Re)initialize the stage at `index`, creating new jobs for its steps
    pub fn update_stage(&mut self, index: usize, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        let description = self.description.stages[index].clone();
        info!(index, stage = %description.name, "update stage");
        if index >= self.tasks.len() {
            let stage = self.build_stage(description.clone());
            self.tasks.push(stage);
        }
        match &mut self.tasks[index] {
            Task::SequentialStage(stage) => {
                stage.set_description(description);
                stage.data.execution.reset();
                // Resume from the stage's cursor: steps the stage already
                // completed keep their identity and return code.
                let resume_at = stage.current.min(stage.n_steps().saturating_sub(1));
                stage.current = resume_at;
                stage.update_step(resume_at, ctx)
            }
            Task::ParallelStage(stage) => {
                stage.set_description(description);
                stage.data.execution.reset();
                stage.initialize_all(ctx)
            }
            _ => Err(WorkflowError::transition(format!(
                "child #{index} of the workflow is not a stage"
            ))),
        }
    }

    /// Progress to the next stage after the stage at `done` terminated
    pub fn next(&mut self, done: usize, ctx: &WorkflowContext) -> Result<TaskState, WorkflowError> {
        let exitcode = self.tasks[done].exitcode();
        self.data.execution.exitcode = exitcode;
        if exitcode != Some(0) {
            // Abort on error: no further stage is built.
            return Ok(TaskState::Terminated);
        }
        info!(stage = %self.description.stages[done].name, "stage is done");
        if done + 1 < self.n_stages() {
            if self.waiting_time_secs > 0 {
                debug!(seconds = self.waiting_time_secs, "wait before transition");
                std::thread::sleep(std::time::Duration::from_secs(self.waiting_time_secs));
            }
            let next_name = &self.description.stages[done + 1].name;
            info!(
                "transit to next stage ({} of {}): \"{}\"",
                done + 2,
                self.n_stages(),
                next_name
            );
            self.update_stage(done + 1, ctx)?;
            self.current = done + 1;
            Ok(TaskState::Running)
        } else {
            Ok(TaskState::Terminated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batches::{BatchSet, RunBatch};
    use crate::description::StepDescription;
    use crate::jobs::ArgMap;
    use crate::step_api::{StepApi, StepContext, StepRegistry, SubmissionArgs};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NamedStep(&'static str);

    #[async_trait]
    impl StepApi for NamedStep {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn delete_previous_job_output(&self, _ctx: &StepContext) -> Result<(), WorkflowError> {
            Ok(())
        }

        async fn create_run_batches(
            &self,
            _ctx: &StepContext,
            _batch_args: &ArgMap,
        ) -> Result<BatchSet, WorkflowError> {
            Ok(BatchSet::default())
        }

        async fn run_job(
            &self,
            _ctx: &StepContext,
            _batch: &RunBatch,
            _assume_clean_state: bool,
        ) -> Result<(), WorkflowError> {
            Ok(())
        }
    }

    fn step_description(name: &str, active: bool) -> StepDescription {
        StepDescription {
            name: name.into(),
            active,
            batch_args: ArgMap::new(),
            submission_args: Some(SubmissionArgs {
                duration: "00:10:00".parse().unwrap(),
                memory: 1000,
                cores: 1,
            }),
            extra_args: ArgMap::new(),
        }
    }

    fn description() -> WorkflowDescription {
        WorkflowDescription {
            workflow_type: "custom".into(),
            stages: vec![
                StageDescription {
                    name: "conversion".into(),
                    active: true,
                    mode: StageMode::Sequential,
                    steps: vec![
                        step_description("metadata", true),
                        step_description("extraction", false),
                    ],
                },
                StageDescription {
                    name: "analysis".into(),
                    active: false,
                    mode: StageMode::Parallel,
                    steps: vec![step_description("measure", true)],
                },
            ],
        }
    }

    fn context(root: &std::path::Path) -> WorkflowContext {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(NamedStep("metadata")));
        registry.register(Arc::new(NamedStep("extraction")));
        registry.register(Arc::new(NamedStep("measure")));
        WorkflowContext::new(Arc::new(registry), 1, root, "anna")
    }

    #[test]
    fn test_inactive_stages_and_steps_are_filtered() {
        let workflow = Workflow::new("exp_1", 1, &description(), 0);
        assert_eq!(workflow.n_stages(), 1);
        assert_eq!(workflow.description.stages[0].steps.len(), 1);
        assert_eq!(workflow.tasks.len(), 1);
    }

    #[test]
    fn test_all_stages_inactive_yields_empty_workflow() {
        let mut desc = description();
        for stage in &mut desc.stages {
            stage.active = false;
        }
        let workflow = Workflow::new("exp_1", 1, &desc, 0);
        assert_eq!(workflow.n_stages(), 0);
        assert!(workflow.tasks.is_empty());
    }

    #[test]
    fn test_start_initializes_only_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut desc = description();
        desc.stages[1].active = true;
        let mut workflow = Workflow::new("exp_1", 1, &desc, 0);
        workflow.start(&ctx).unwrap();

        // First stage's first step has phase jobs
        let first_step = &workflow.tasks[0].children().unwrap()[0];
        assert_eq!(first_step.children().unwrap().len(), 2);
        // Second stage's steps are still bare
        let second_step = &workflow.tasks[1].children().unwrap()[0];
        assert!(second_step.children().unwrap().is_empty());
    }

    #[test]
    fn test_stage_index_lookup() {
        let workflow = Workflow::new("exp_1", 1, &description(), 0);
        assert_eq!(workflow.stage_index("conversion").unwrap(), 0);
        assert!(matches!(
            workflow.stage_index("analysis"),
            Err(WorkflowError::Description(_))
        ));
    }

    #[test]
    fn test_next_advances_to_next_stage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut desc = description();
        desc.stages[1].active = true;
        let mut workflow = Workflow::new("exp_1", 1, &desc, 0);
        workflow.start(&ctx).unwrap();

        workflow.tasks[0].data_mut().execution.state = TaskState::Terminated;
        workflow.tasks[0].data_mut().execution.exitcode = Some(0);
        let state = workflow.next(0, &ctx).unwrap();
        assert_eq!(state, TaskState::Running);
        assert_eq!(workflow.current, 1);
        // The parallel stage got all of its steps initialized
        let step = &workflow.tasks[1].children().unwrap()[0];
        assert_eq!(step.children().unwrap().len(), 2);
    }

    #[test]
    fn test_next_propagates_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut workflow = Workflow::new("exp_1", 1, &description(), 0);
        workflow.start(&ctx).unwrap();
        workflow.tasks[0].data_mut().execution.state = TaskState::Terminated;
        workflow.tasks[0].data_mut().execution.exitcode = Some(5);

        assert_eq!(workflow.next(0, &ctx).unwrap(), TaskState::Terminated);
        assert_eq!(workflow.data.execution.exitcode, Some(5));
    }
}
