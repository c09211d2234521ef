//! The status command: query the persisted tree without driving the engine.
//!
//! This is the same query contract the HTTP status server uses to feed the
//! UI; nothing here touches the cluster.

use anyhow::Context;

use mosaic_storage::{PostgresTaskStore, TaskStore};

use crate::output::print_status;
use crate::Cli;

use super::{resolve_env, PROGRAM};

pub async fn run(cli: &Cli, depth: usize, format: &str) -> anyhow::Result<i32> {
    let env = resolve_env(cli)?;
    let store = PostgresTaskStore::connect(&env.database_url).await?;
    store.migrate().await?;

    let task_id = store
        .most_recent_top_task(cli.experiment_id, PROGRAM)
        .await?
        .with_context(|| {
            format!(
                "no previous submission found for experiment {}",
                cli.experiment_id
            )
        })?;
    let snapshot = store.task_status(task_id, depth).await?;
    print_status(&snapshot, format)?;
    Ok(0)
}
