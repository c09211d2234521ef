//! Descriptions of what a leaf job executes on a worker node.
//!
//! A [`JobSpec`] is a structured record rather than a command line; the
//! engine's cluster backend decides how to materialize it (spawning the
//! `mosaic exec` entry point, wrapping it in a scheduler script, or calling
//! the step API directly when running in-process).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mosaic_core::ExperimentId;

/// Arbitrary step argument mapping (`name → value`)
pub type ArgMap = Map<String, Value>;

/// Which phase of a step a job executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseSpec {
    /// Partition the work: delete previous output, create and write batches
    Init {
        batch_args: ArgMap,
        extra_args: ArgMap,
    },

    /// Process one batch
    Run { job_id: u32, index: Option<u32> },

    /// Post-process the output of all run jobs
    Collect,
}

/// Description of a single cluster job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Name of the step this job belongs to
    pub step_name: String,

    /// Experiment the job processes
    pub experiment_id: ExperimentId,

    /// Root directory of the workflow data for this experiment
    pub workflow_root: PathBuf,

    /// Phase the job executes
    pub phase: PhaseSpec,

    /// Logging verbosity forwarded to the worker process
    pub verbosity: u8,
}

impl JobSpec {
    /// Base name of the job, also used as the prefix of its log files
    ///
    /// `<step>_init`, `<step>_run_NNNNNN` (or `<step>_run-II_NNNNNN` for
    /// indexed sub-phases) and `<step>_collect`.
    pub fn job_name(&self) -> String {
        match &self.phase {
            PhaseSpec::Init { .. } => format!("{}_init", self.step_name),
            PhaseSpec::Run { job_id, index } => match index {
                None => format!("{}_run_{:06}", self.step_name, job_id),
                Some(index) => format!("{}_run-{:02}_{:06}", self.step_name, index, job_id),
            },
            PhaseSpec::Collect => format!("{}_collect", self.step_name),
        }
    }

    /// Directory where the job's log files are written
    pub fn log_location(&self) -> PathBuf {
        self.workflow_root.join(&self.step_name).join("log")
    }

    /// Argument vector for the `mosaic exec` worker entry point
    ///
    /// The command shape is `mosaic <experiment> [-v...] exec
    /// --workflow-root <dir> <step> <phase> [phase args]`.
    pub fn to_exec_args(&self) -> Vec<String> {
        let mut args = vec![self.experiment_id.to_string()];
        for _ in 0..self.verbosity {
            args.push("-v".to_string());
        }
        args.extend([
            "exec".to_string(),
            "--workflow-root".to_string(),
            self.workflow_root.to_string_lossy().into_owned(),
            self.step_name.clone(),
        ]);
        match &self.phase {
            PhaseSpec::Init {
                batch_args,
                extra_args,
            } => {
                args.push("init".to_string());
                args.push("--batch-args".to_string());
                args.push(serde_json::Value::Object(batch_args.clone()).to_string());
                args.push("--extra-args".to_string());
                args.push(serde_json::Value::Object(extra_args.clone()).to_string());
            }
            PhaseSpec::Run { job_id, index } => {
                args.push("run".to_string());
                args.push("--job".to_string());
                args.push(job_id.to_string());
                if let Some(index) = index {
                    args.push("--index".to_string());
                    args.push(index.to_string());
                }
            }
            PhaseSpec::Collect => args.push("collect".to_string()),
        }
        args
    }
}

/// File names of a job's log pair for a given submission timestamp
pub fn log_file_names(job_name: &str, timestamp: &str) -> (String, String) {
    (
        format!("{job_name}_{timestamp}.out"),
        format!("{job_name}_{timestamp}.err"),
    )
}

/// Find the most recent log pair of a job
///
/// Log files carry a sortable timestamp suffix, so the lexicographically
/// last match wins. Returns `None` when the job never produced logs.
pub fn find_latest_log_pair(log_location: &Path, job_name: &str) -> Option<(PathBuf, PathBuf)> {
    let out_prefix = format!("{job_name}_");
    let mut outs: Vec<PathBuf> = std::fs::read_dir(log_location)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "out")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&out_prefix))
        })
        .collect();
    outs.sort();
    let out = outs.pop()?;
    let err = out.with_extension("err");
    Some((out, err))
}
