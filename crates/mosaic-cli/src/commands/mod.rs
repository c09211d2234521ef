pub mod exec;
pub mod manager;
pub mod status;

use std::path::PathBuf;

use anyhow::Context;

use mosaic_core::Config;

use crate::Cli;

/// Resolved manager environment
pub struct ManagerEnv {
    pub database_url: String,

    /// Workflow root of the processed experiment
    pub workflow_root: PathBuf,

    pub user_name: String,
}

/// Resolve database, workflow root and user from flags and environment
///
/// Command-line flags win over the environment-derived [`Config`].
pub fn resolve_env(cli: &Cli) -> anyhow::Result<ManagerEnv> {
    let config = Config::from_env().ok();
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| config.as_ref().map(|c| c.database_url.clone()))
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("no database configured; set MOSAIC_DATABASE_URL or pass --database-url")?;
    let workflow_root = match &cli.workflow_root {
        Some(root) => root.clone(),
        None => config
            .as_ref()
            .map(|c| c.experiment_workflow_root(cli.experiment_id))
            .context(
                "no workflow root configured; set MOSAIC_WORKFLOW_ROOT or pass --workflow-root",
            )?,
    };
    let user_name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    Ok(ManagerEnv {
        database_url,
        workflow_root,
        user_name,
    })
}

/// Program name submissions are registered under
pub const PROGRAM: &str = "workflow";
