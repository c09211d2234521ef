//! The step driver: sequential composition of init, run fan-out and
//! optional collect.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mosaic_core::{SubmissionId, Walltime, WorkflowError};

use crate::batches::{read_run_batches, RunBatch, StepLayout};
use crate::description::StepDescription;
use crate::jobs::{JobSpec, PhaseSpec};
use crate::task::{
    CollectJob, InitJob, JobData, MultiRunJobCollection, ResourceRequest, RunJob,
    RunJobCollection, Task, TaskState,
};

use super::WorkflowContext;

// Fixed allocations for the lightweight init and collect phases; the run
// phase uses the step's submission arguments.
const INIT_WALLTIME_SECS: u64 = 2 * 3600;
const INIT_MEMORY_MB: u64 = 2000;
const COLLECT_WALLTIME_SECS: u64 = 2 * 3600;
const COLLECT_MEMORY_MB: u64 = 4000;

/// A workflow step: one parallelization unit within a larger workflow
///
/// Children are the phases in order: the init job, the run collection and,
/// for steps with a collect phase, the collect job. The run collection is
/// an empty placeholder until the init phase terminated successfully; only
/// then is it replaced by the populated collection, since the number of run
/// jobs is unknown before init has partitioned the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub data: JobData,
    pub step_name: String,
    pub description: StepDescription,

    /// Zero-based index of the phase currently being processed
    pub current: usize,

    #[serde(skip)]
    pub tasks: Vec<Task>,
}

impl WorkflowStep {
    /// Create a step without any jobs; phases are built by `initialize`
    pub fn new(description: StepDescription, submission_id: SubmissionId) -> Self {
        Self {
            data: JobData::new(description.name.clone(), submission_id),
            step_name: description.name.clone(),
            description,
            current: 0,
            tasks: Vec::new(),
        }
    }

    /// Build the phase jobs of this step
    ///
    /// Creates the init job, the placeholder run collection and, when the
    /// step implementation declares one, the collect job.
    pub fn initialize(&mut self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        info!(step = %self.step_name, "create jobs for \"init\" phase");
        let api = ctx.registry.get(&self.step_name)?;
        self.tasks.clear();
        self.current = 0;
        self.data.execution.reset();

        let init_spec = JobSpec {
            step_name: self.step_name.clone(),
            experiment_id: ctx.experiment_id,
            workflow_root: ctx.workflow_root.clone(),
            phase: PhaseSpec::Init {
                batch_args: self.description.batch_args.clone(),
                extra_args: self.description.extra_args.clone(),
            },
            verbosity: ctx.verbosity,
        };
        self.tasks.push(Task::Init(InitJob {
            data: JobData::new(init_spec.job_name(), self.data.submission_id),
            spec: init_spec,
            resources: ResourceRequest::new(
                Walltime::from_secs(INIT_WALLTIME_SECS),
                INIT_MEMORY_MB,
                1,
            )?,
            handle: None,
        }));

        self.tasks.push(Task::RunCollection(RunJobCollection::new(
            &self.step_name,
            self.data.submission_id,
            None,
        )));

        if api.has_collect_phase() {
            debug!(step = %self.step_name, "create job for \"collect\" phase");
            let collect_spec = JobSpec {
                step_name: self.step_name.clone(),
                experiment_id: ctx.experiment_id,
                workflow_root: ctx.workflow_root.clone(),
                phase: PhaseSpec::Collect,
                verbosity: ctx.verbosity,
            };
            self.tasks.push(Task::Collect(CollectJob {
                data: JobData::new(collect_spec.job_name(), self.data.submission_id),
                spec: collect_spec,
                resources: ResourceRequest::new(
                    Walltime::from_secs(COLLECT_WALLTIME_SECS),
                    COLLECT_MEMORY_MB,
                    1,
                )?,
                handle: None,
            }));
        }
        Ok(())
    }

    /// Populate the run collection from the batch files written by init
    ///
    /// Replaces the placeholder collection; run jobs get their resource
    /// requests from the step's submission arguments. Batches carrying a
    /// sub-phase index are grouped into one collection per index, processed
    /// sequentially.
    pub fn create_run_jobs(&mut self, ctx: &WorkflowContext) -> Result<(), WorkflowError> {
        if self.tasks.len() < 2 {
            return Err(WorkflowError::transition(format!(
                "attempt to set \"run\" jobs of step \"{}\" before the \"init\" phase",
                self.step_name
            )));
        }
        let layout = StepLayout::new(&ctx.workflow_root, &self.step_name);
        let batches = read_run_batches(&layout)?;
        if batches.is_empty() {
            return Err(WorkflowError::transition(format!(
                "no batches were created for step \"{}\"",
                self.step_name
            )));
        }

        let args = self.description.submission_args();
        info!(step = %self.step_name, n_jobs = batches.len(), "create jobs for \"run\" phase");
        debug!(
            duration = %args.duration, memory_mb = args.memory, cores = args.cores,
            "allocated resources per \"run\" job"
        );
        let resources = ResourceRequest::new(args.duration, args.memory, args.cores)?;

        let indexed = batches.iter().any(|batch| batch.index.is_some());
        let collection = if indexed {
            let mut multi = MultiRunJobCollection::new(&self.step_name, self.data.submission_id);
            let mut indexes: Vec<u32> = batches
                .iter()
                .map(|batch| batch.index.unwrap_or(0))
                .collect();
            indexes.sort_unstable();
            indexes.dedup();
            for index in indexes {
                let mut collection =
                    RunJobCollection::new(&self.step_name, self.data.submission_id, Some(index));
                for batch in batches
                    .iter()
                    .filter(|batch| batch.index.unwrap_or(0) == index)
                {
                    collection
                        .tasks
                        .push(self.build_run_job(ctx, batch, resources.clone()));
                }
                multi.tasks.push(Task::RunCollection(collection));
            }
            Task::MultiRunCollection(multi)
        } else {
            let mut collection =
                RunJobCollection::new(&self.step_name, self.data.submission_id, None);
            for batch in &batches {
                collection
                    .tasks
                    .push(self.build_run_job(ctx, batch, resources.clone()));
            }
            Task::RunCollection(collection)
        };

        self.tasks[1] = collection;
        Ok(())
    }

    fn build_run_job(
        &self,
        ctx: &WorkflowContext,
        batch: &RunBatch,
        resources: ResourceRequest,
    ) -> Task {
        let spec = JobSpec {
            step_name: self.step_name.clone(),
            experiment_id: ctx.experiment_id,
            workflow_root: ctx.workflow_root.clone(),
            phase: PhaseSpec::Run {
                job_id: batch.id,
                index: batch.index,
            },
            verbosity: ctx.verbosity,
        };
        Task::Run(RunJob {
            data: JobData::new(spec.job_name(), self.data.submission_id),
            job_id: batch.id,
            index: batch.index,
            spec,
            resources,
            handle: None,
        })
    }

    /// Progress to the next phase after the phase at `done` terminated
    ///
    /// A non-zero return code of the finished phase terminates the step
    /// with that code. When init just finished, the run collection is
    /// populated before the step keeps running.
    pub fn next(&mut self, done: usize, ctx: &WorkflowContext) -> Result<TaskState, WorkflowError> {
        let exitcode = self.tasks[done].exitcode();
        self.data.execution.exitcode = exitcode;
        if exitcode != Some(0) {
            return Ok(TaskState::Terminated);
        }
        if done == 0 {
            // The run collection exists as a placeholder; the knowledge to
            // populate it only became available when init terminated.
            self.create_run_jobs(ctx)?;
        }
        if done + 1 < self.tasks.len() {
            self.current = done + 1;
            Ok(TaskState::Running)
        } else {
            Ok(TaskState::Terminated)
        }
    }
}
