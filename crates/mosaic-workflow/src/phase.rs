//! Execution of a single phase of a step on a worker node.
//!
//! This is the code path behind a leaf job, shared by the `mosaic exec`
//! entry point (cluster deployments) and the in-process backend (embedded
//! use and tests).

use tracing::info;

use mosaic_core::WorkflowError;

use crate::batches::{read_collect_batch, read_run_batch, write_batch_set};
use crate::jobs::{JobSpec, PhaseSpec};
use crate::step_api::{StepContext, StepRegistry};

/// Execute the phase described by `spec` to completion
///
/// Init deletes previous job output, partitions the work and writes the
/// batch files; run and collect read their batch back from disk and hand
/// it to the step implementation.
pub async fn execute_phase(registry: &StepRegistry, spec: &JobSpec) -> Result<(), WorkflowError> {
    let api = registry.get(&spec.step_name)?;
    let extra_args = match &spec.phase {
        PhaseSpec::Init { extra_args, .. } => extra_args.clone(),
        _ => Default::default(),
    };
    let ctx = StepContext::new(
        spec.experiment_id,
        &spec.workflow_root,
        &spec.step_name,
        spec.verbosity,
        extra_args,
    );
    ctx.layout.ensure_directories()?;

    match &spec.phase {
        PhaseSpec::Init { batch_args, .. } => {
            info!(step = %spec.step_name, "delete previous job output");
            api.delete_previous_job_output(&ctx).await?;
            info!(step = %spec.step_name, "create batches");
            let batches = api.create_run_batches(&ctx, batch_args).await?;
            if api.has_collect_phase() && batches.collect.is_none() {
                return Err(WorkflowError::job_description(format!(
                    "step \"{}\" has a collect phase but created no collect batch",
                    spec.step_name
                )));
            }
            let mut ids = std::collections::HashSet::new();
            for batch in &batches.run {
                if !ids.insert(batch.id) {
                    return Err(WorkflowError::job_description(format!(
                        "duplicate run batch id {} in step \"{}\"",
                        batch.id, spec.step_name
                    )));
                }
            }
            write_batch_set(&ctx.layout, &batches)?;
            info!(
                step = %spec.step_name,
                n_run = batches.run.len(),
                collect = batches.collect.is_some(),
                "wrote batch files"
            );
            Ok(())
        }
        PhaseSpec::Run { job_id, .. } => {
            let batch = read_run_batch(&ctx.layout, *job_id)?;
            info!(step = %spec.step_name, job_id, "run job");
            api.run_job(&ctx, &batch, false).await
        }
        PhaseSpec::Collect => {
            let batch = read_collect_batch(&ctx.layout)?;
            info!(step = %spec.step_name, "collect job output");
            api.collect_job_output(&ctx, &batch).await
        }
    }
}
