//! Output formatting for status snapshots.

use anyhow::bail;

use mosaic_workflow::snapshot::TaskStatus;

/// Print a snapshot in the requested format (text, json or yaml)
pub fn print_status(snapshot: &TaskStatus, format: &str) -> anyhow::Result<()> {
    match format {
        "text" => println!("{}", snapshot.format_table()),
        "json" => println!("{}", serde_json::to_string_pretty(snapshot)?),
        "yaml" => print!("{}", serde_yaml::to_string(snapshot)?),
        other => bail!("unknown output format \"{other}\""),
    }
    Ok(())
}
