//! Stage drivers: sequential and parallel composition of steps.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mosaic_core::{SubmissionId, WorkflowError};

use crate::description::StageDescription;
use crate::task::{JobData, Task, TaskState};

use super::{WorkflowContext, WorkflowStep};

fn create_steps(description: &StageDescription, submission_id: SubmissionId) -> Vec<Task> {
    description
        .steps
        .iter()
        .map(|step| Task::Step(WorkflowStep::new(step.clone(), submission_id)))
        .collect()
}

/// A stage whose steps are processed one after another
///
/// The number of jobs is generally only known for the first step; batches
/// of subsequent steps depend on the output of their predecessor, so each
/// step is initialized lazily upon transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialStage {
    pub data: JobData,
    pub description: StageDescription,

    /// Zero-based index of the step currently being processed
    pub current: usize,

    /// Seconds to wait before advancing, to give shared filesystems time
    /// to make the previous step's output visible
    pub waiting_time_secs: u64,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl SequentialStage {
    pub fn new(
        description: StageDescription,
        submission_id: SubmissionId,
        waiting_time_secs: u64,
    ) -> Self {
        let tasks = create_steps(&description, submission_id);
        Self {
            data: JobData::new(description.name.clone(), submission_id),
            description,
            current: 0,
            waiting_time_secs,
            tasks,
        }
    }

    /// Number of steps in the stage
    pub fn n_steps(&self) -> usize {
        self.description.steps.len()
    }

    /// Replace the stage description, keeping step tasks where possible
    pub fn set_description(&mut self, description: StageDescription) {
        if description.steps.len() != self.tasks.len() {
            self.tasks = create_steps(&description, self.data.submission_id);
        }
        self.description = description;
    }

    /// (Re)initialize the step at `index`, creating new jobs for it
    pub fn update_step(&mut self, index: usize, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        debug!(stage = %self.data.name, index, "create job descriptions for next step");
        let description = self.description.steps[index].clone();
        let Task::Step(step) = &mut self.tasks[index] else {
            return Err(WorkflowError::transition(format!(
                "child #{index} of stage \"{}\" is not a workflow step",
                self.data.name
            )));
        };
        step.description = description;
        step.step_name = step.description.name.clone();
        step.data.name = step.description.name.clone();
        step.initialize(ctx)
    }

    /// Progress to the next step after the step at `done` terminated
    pub fn next(&mut self, done: usize, ctx: &WorkflowContext) -> Result<TaskState, WorkflowError> {
        let exitcode = self.tasks[done].exitcode();
        self.data.execution.exitcode = exitcode;
        if exitcode != Some(0) {
            // Abort on error: the stage terminates with the failed step's
            // return code and no further step is built.
            return Ok(TaskState::Terminated);
        }
        info!(step = %self.description.steps[done].name, "step is done");
        if done + 1 < self.n_steps() {
            if self.waiting_time_secs > 0 {
                debug!(seconds = self.waiting_time_secs, "wait before transition");
                std::thread::sleep(std::time::Duration::from_secs(self.waiting_time_secs));
            }
            let next_name = &self.description.steps[done + 1].name;
            info!(
                "transit to next step ({} of {}): \"{}\"",
                done + 2,
                self.n_steps(),
                next_name
            );
            self.update_step(done + 1, ctx)?;
            self.current = done + 1;
            Ok(TaskState::Running)
        } else {
            Ok(TaskState::Terminated)
        }
    }
}

/// A stage whose steps are initialized up front and run concurrently
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStage {
    pub data: JobData,
    pub description: StageDescription,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl ParallelStage {
    pub fn new(description: StageDescription, submission_id: SubmissionId) -> Self {
        let tasks = create_steps(&description, submission_id);
        Self {
            data: JobData::new(description.name.clone(), submission_id),
            description,
            tasks,
        }
    }

    /// Replace the stage description, keeping step tasks where possible
    pub fn set_description(&mut self, description: StageDescription) {
        if description.steps.len() != self.tasks.len() {
            self.tasks = create_steps(&description, self.data.submission_id);
        }
        self.description = description;
    }

    /// Initialize every step of the stage
    pub fn initialize_all(&mut self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        for index in 0..self.description.steps.len() {
            let description = self.description.steps[index].clone();
            let Task::Step(step) = &mut self.tasks[index] else {
                return Err(WorkflowError::transition(format!(
                    "child #{index} of stage \"{}\" is not a workflow step",
                    self.data.name
                )));
            };
            step.description = description;
            step.step_name = step.description.name.clone();
            step.data.name = step.description.name.clone();
            step.initialize(ctx)?;
        }
        Ok(())
    }
}
