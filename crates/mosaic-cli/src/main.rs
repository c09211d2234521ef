// Mosaic workflow manager
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: The worker entry point (`mosaic exec`) lives in the same
// binary so cluster nodes need a single executable on PATH.

mod commands;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mosaic_workflow::step_api::{StepRegistry, WorkflowTypeRegistry};

#[derive(Parser)]
#[command(name = "mosaic")]
#[command(about = "Mosaic workflow manager - submit and monitor image-analysis pipelines")]
#[command(version)]
pub struct Cli {
    /// ID of the experiment that should be processed
    pub experiment_id: i64,

    /// Increase logging verbosity (-v, -vv, ...)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Root directory for workflow data (overrides MOSAIC_WORKFLOW_ROOT)
    #[arg(long)]
    pub workflow_root: Option<PathBuf>,

    /// Database connection string (overrides MOSAIC_DATABASE_URL)
    #[arg(long, env = "MOSAIC_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a workflow, submit it to the cluster and monitor its status
    Submit {
        /// Workflow description file (defaults to
        /// <workflow_root>/workflow_description.yaml)
        #[arg(long)]
        description: Option<PathBuf>,

        /// Number of task tree levels that should be monitored
        #[arg(long, short = 'd', default_value_t = 2)]
        monitoring_depth: usize,

        /// Seconds between monitoring iterations
        #[arg(long, short = 'i', default_value_t = 10)]
        monitoring_interval: u64,

        /// Also submit inactivated stages and steps
        #[arg(long, short)]
        force: bool,
    },

    /// Resubmit a previously created workflow at a given stage
    Resubmit {
        /// Workflow description file (defaults to
        /// <workflow_root>/workflow_description.yaml)
        #[arg(long)]
        description: Option<PathBuf>,

        /// Name of the stage at which the workflow should be resubmitted
        #[arg(long, short)]
        stage: String,

        /// Number of task tree levels that should be monitored
        #[arg(long, short = 'd', default_value_t = 2)]
        monitoring_depth: usize,

        /// Seconds between monitoring iterations
        #[arg(long, short = 'i', default_value_t = 10)]
        monitoring_interval: u64,
    },

    /// Print the status of the most recent submission
    Status {
        /// Number of task tree levels to include
        #[arg(long, short = 'd', default_value_t = 2)]
        monitoring_depth: usize,

        /// Output format
        #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
        output: String,
    },

    /// Execute a single phase of a step (worker entry point)
    #[command(hide = true)]
    Exec(commands::exec::ExecArgs),
}

/// Step implementations linked into this binary
///
/// Platform deployments register their step crates here; the registries
/// are immutable once the process is up.
fn build_registries() -> (Arc<StepRegistry>, Arc<WorkflowTypeRegistry>) {
    let steps = StepRegistry::new();
    let types = WorkflowTypeRegistry::new();
    (Arc::new(steps), Arc::new(types))
}

fn init_tracing(verbosity: u8) {
    let directive = match verbosity {
        0 => "warn,mosaic=info",
        1 => "info,mosaic=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);
    let (steps, types) = build_registries();

    let result = match &cli.command {
        Commands::Submit { .. } | Commands::Resubmit { .. } => {
            commands::manager::run(&cli, steps, types).await
        }
        Commands::Status {
            monitoring_depth,
            output,
        } => commands::status::run(&cli, *monitoring_depth, output).await,
        Commands::Exec(args) => commands::exec::run(&cli, args, steps).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            tracing::error!("{error:#}");
            std::process::exit(1);
        }
    }
}
