//! The hidden exec command: worker-node entry point for a single phase.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use tracing::error;

use mosaic_workflow::jobs::{ArgMap, JobSpec, PhaseSpec};
use mosaic_workflow::phase::execute_phase;
use mosaic_workflow::step_api::StepRegistry;

use crate::Cli;

#[derive(Args)]
pub struct ExecArgs {
    /// Root directory of the experiment's workflow data
    #[arg(long)]
    pub workflow_root: PathBuf,

    /// Name of the step
    pub step: String,

    #[command(subcommand)]
    pub phase: ExecPhase,
}

#[derive(Subcommand)]
pub enum ExecPhase {
    /// Delete previous output and create the batches for this step
    Init {
        /// Batch arguments as a JSON object
        #[arg(long, default_value = "{}")]
        batch_args: String,

        /// Extra step arguments as a JSON object
        #[arg(long, default_value = "{}")]
        extra_args: String,
    },

    /// Process one batch
    Run {
        /// One-based job identifier
        #[arg(long)]
        job: u32,

        /// Sub-phase index for steps with multiple run collections
        #[arg(long)]
        index: Option<u32>,
    },

    /// Post-process the output of the run phase
    Collect,
}

fn parse_arg_map(value: &str, what: &str) -> anyhow::Result<ArgMap> {
    serde_json::from_str(value).with_context(|| format!("{what} is not a JSON object"))
}

pub async fn run(cli: &Cli, args: &ExecArgs, steps: Arc<StepRegistry>) -> anyhow::Result<i32> {
    let phase = match &args.phase {
        ExecPhase::Init {
            batch_args,
            extra_args,
        } => PhaseSpec::Init {
            batch_args: parse_arg_map(batch_args, "--batch-args")?,
            extra_args: parse_arg_map(extra_args, "--extra-args")?,
        },
        ExecPhase::Run { job, index } => PhaseSpec::Run {
            job_id: *job,
            index: *index,
        },
        ExecPhase::Collect => PhaseSpec::Collect,
    };
    let spec = JobSpec {
        step_name: args.step.clone(),
        experiment_id: cli.experiment_id,
        workflow_root: args.workflow_root.clone(),
        phase,
        verbosity: cli.verbosity,
    };
    match execute_phase(&steps, &spec).await {
        Ok(()) => Ok(0),
        Err(error) => {
            // The message goes to the job's stderr log via the backend's
            // redirection; the exit code is what the engine reads.
            error!(job = %spec.job_name(), "{error}");
            eprintln!("{error}");
            Ok(1)
        }
    }
}
