//! The monitor loop: drives the engine, records progress, honors
//! cancellation.

use std::time::{Duration, Instant};

use tracing::{error, info};

use mosaic_core::duration::format_elapsed;
use mosaic_core::TaskId;
use mosaic_workflow::jobs::find_latest_log_pair;
use mosaic_workflow::snapshot::TaskStatus;
use mosaic_workflow::task::Task;

use crate::engine::Engine;
use crate::EngineError;

/// How many trailing stderr lines the failure report quotes per job
const STDERR_EXCERPT_LINES: usize = 15;

/// Options for a monitored submission
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Seconds between monitoring iterations
    pub interval: Duration,

    /// Recursion depth of the periodic status snapshots
    pub depth: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            depth: 2,
        }
    }
}

/// Add `root` to the engine and drive it until the tree is terminal
///
/// Performs the loop of sleep, tick, snapshot; prints the snapshot table
/// each iteration. After the root reaches a terminal state one extra tick
/// flushes late accounting updates, then every failed leaf is logged with
/// an excerpt of its stderr log. A user interrupt requests cancellation at
/// the engine and drains until all leaves are terminal.
///
/// Returns the final full-depth snapshot.
pub async fn submit_and_monitor(
    engine: &mut Engine,
    root: Task,
    start_index: usize,
    options: &MonitorOptions,
) -> Result<TaskStatus, EngineError> {
    let root_id = engine.add(root)?;
    engine.redo(root_id, start_index).await?;

    let submitted_at = Instant::now();
    let mut break_next = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("processing interrupted; killing jobs");
                kill_and_drain(engine, root_id, options.interval).await?;
                break;
            }
        }

        info!(elapsed = %format_elapsed(submitted_at.elapsed()), "progress...");
        engine.progress().await?;

        let snapshot = engine.store().task_status(root_id, options.depth).await?;
        println!("{}\n", snapshot.format_table());

        if break_next {
            break;
        }
        let root_state = engine
            .root(root_id)
            .ok_or(EngineError::UnknownTask(root_id))?
            .state();
        if root_state.is_terminal() {
            // One more iteration to flush late accounting updates.
            break_next = true;
            engine.progress().await?;
        }
    }

    let final_snapshot = engine.store().task_status(root_id, usize::MAX).await?;
    log_task_failures(&final_snapshot, engine);
    Ok(final_snapshot)
}

async fn kill_and_drain(
    engine: &mut Engine,
    root_id: TaskId,
    interval: Duration,
) -> Result<(), EngineError> {
    engine.kill(root_id).await?;
    loop {
        engine.progress().await?;
        let root = engine
            .root(root_id)
            .ok_or(EngineError::UnknownTask(root_id))?;
        if root.state().is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(interval.min(Duration::from_secs(1))).await;
    }
}

/// Log every failed leaf with its name, return code and stderr excerpt
pub fn log_task_failures(snapshot: &TaskStatus, engine: &Engine) {
    for failed in snapshot.failed_leaves() {
        let excerpt = stderr_excerpt(engine, failed).unwrap_or_default();
        error!(
            job = %failed.name,
            exitcode = failed.exitcode.unwrap_or(-1),
            "job failed{}{}",
            if excerpt.is_empty() { "" } else { "; stderr:\n" },
            excerpt
        );
    }
}

/// Strip the phase suffix from a job name to recover its step name
fn step_of(job_name: &str) -> Option<&str> {
    ["_init", "_collect", "_run"]
        .iter()
        .find_map(|marker| job_name.rfind(marker).map(|pos| &job_name[..pos]))
}

fn stderr_excerpt(engine: &Engine, failed: &TaskStatus) -> Option<String> {
    // Job names are "<step>_<phase>..."; the log directory lives below the
    // step directory of the workflow root.
    let step_name = step_of(&failed.name)?;
    let log_location = engine
        .context()
        .workflow_root
        .join(step_name)
        .join("log");
    let (_, err) = find_latest_log_pair(&log_location, &failed.name)?;
    let contents = std::fs::read_to_string(err).ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
    Some(lines[start..].join("\n"))
}
