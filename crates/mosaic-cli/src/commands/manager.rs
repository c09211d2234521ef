//! The submit and resubmit commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;

use mosaic_engine::{submit_and_monitor, Engine, LocalBackend, MonitorOptions};
use mosaic_storage::{PostgresTaskStore, TaskStore};
use mosaic_workflow::description::WorkflowDescription;
use mosaic_workflow::driver::{Workflow, WorkflowContext};
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::step_api::{StepRegistry, WorkflowTypeRegistry};
use mosaic_workflow::task::{Task, TaskState};

use crate::{Cli, Commands};

use super::{resolve_env, ManagerEnv, PROGRAM};

pub async fn run(
    cli: &Cli,
    steps: Arc<StepRegistry>,
    types: Arc<WorkflowTypeRegistry>,
) -> anyhow::Result<i32> {
    let env = resolve_env(cli)?;
    let store = PostgresTaskStore::connect(&env.database_url).await?;
    store.migrate().await?;
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let ctx = WorkflowContext::new(
        steps.clone(),
        cli.experiment_id,
        &env.workflow_root,
        &env.user_name,
    )
    .with_verbosity(cli.verbosity);

    match &cli.command {
        Commands::Submit {
            description,
            monitoring_depth,
            monitoring_interval,
            force,
        } => {
            submit(
                cli,
                &env,
                store,
                ctx,
                &steps,
                &types,
                description.as_deref(),
                *monitoring_depth,
                *monitoring_interval,
                *force,
            )
            .await
        }
        Commands::Resubmit {
            description,
            stage,
            monitoring_depth,
            monitoring_interval,
        } => {
            resubmit(
                cli,
                &env,
                store,
                ctx,
                &steps,
                &types,
                description.as_deref(),
                stage,
                *monitoring_depth,
                *monitoring_interval,
            )
            .await
        }
        _ => bail!("not a manager command"),
    }
}

fn load_description(
    env: &ManagerEnv,
    path: Option<&std::path::Path>,
    steps: &StepRegistry,
    types: &WorkflowTypeRegistry,
) -> anyhow::Result<WorkflowDescription> {
    let path: PathBuf = path
        .map(PathBuf::from)
        .unwrap_or_else(|| env.workflow_root.join("workflow_description.yaml"));
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read workflow description {}", path.display()))?;
    let mut description = WorkflowDescription::from_yaml(&contents)?;
    description.validate(steps, types)?;
    Ok(description)
}

fn exit_code(snapshot: &TaskStatus) -> i32 {
    if snapshot.state == TaskState::Terminated && snapshot.exitcode == Some(0) {
        0
    } else {
        snapshot.exitcode.filter(|&code| code != 0).unwrap_or(1)
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit(
    cli: &Cli,
    env: &ManagerEnv,
    store: Arc<dyn TaskStore>,
    ctx: WorkflowContext,
    steps: &StepRegistry,
    types: &WorkflowTypeRegistry,
    description: Option<&std::path::Path>,
    monitoring_depth: usize,
    monitoring_interval: u64,
    force: bool,
) -> anyhow::Result<i32> {
    info!("submit workflow");
    // Description errors are raised before any submission is registered.
    let mut description = load_description(env, description, steps, types)?;
    if force {
        description.activate_all();
    }

    let submission_id = store
        .register_submission(cli.experiment_id, PROGRAM, &env.user_name)
        .await?;
    let mut workflow = Workflow::new(
        format!("experiment_{}", cli.experiment_id),
        submission_id,
        &description,
        0,
    );
    workflow.start(&ctx)?;
    let mut root = Task::Workflow(workflow);
    let root_id = store.save(&mut root).await?;
    store.attach_root(submission_id, root_id).await?;

    let backend = Arc::new(LocalBackend::new()?);
    let mut engine = Engine::new(backend, store, ctx);
    info!("submit and monitor jobs");
    let snapshot = submit_and_monitor(
        &mut engine,
        root,
        0,
        &MonitorOptions {
            interval: Duration::from_secs(monitoring_interval),
            depth: monitoring_depth,
        },
    )
    .await?;
    Ok(exit_code(&snapshot))
}

#[allow(clippy::too_many_arguments)]
async fn resubmit(
    cli: &Cli,
    env: &ManagerEnv,
    store: Arc<dyn TaskStore>,
    ctx: WorkflowContext,
    steps: &StepRegistry,
    types: &WorkflowTypeRegistry,
    description: Option<&std::path::Path>,
    stage: &str,
    monitoring_depth: usize,
    monitoring_interval: u64,
) -> anyhow::Result<i32> {
    let description = load_description(env, description, steps, types)?;
    let task_id = store
        .most_recent_top_task(cli.experiment_id, PROGRAM)
        .await?
        .with_context(|| {
            format!(
                "no previous submission found for experiment {}",
                cli.experiment_id
            )
        })?;
    let mut root = store.load(task_id).await?;
    let Task::Workflow(workflow) = &mut root else {
        bail!("persisted task {task_id} is not a workflow");
    };
    workflow.update_description(&description);
    let start_index = workflow.stage_index(stage)?;
    info!(stage, start_index, "resubmit workflow");
    workflow.update_stage(start_index, &ctx)?;
    store.save(&mut root).await?;

    let backend = Arc::new(LocalBackend::new()?);
    let mut engine = Engine::new(backend, store, ctx);
    info!("resubmit and monitor jobs");
    let snapshot = submit_and_monitor(
        &mut engine,
        root,
        start_index,
        &MonitorOptions {
            interval: Duration::from_secs(monitoring_interval),
            depth: monitoring_depth,
        },
    )
    .await?;
    Ok(exit_code(&snapshot))
}
