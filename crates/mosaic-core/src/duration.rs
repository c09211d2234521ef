//! Walltime values in the `HH:MM:SS` format used by cluster schedulers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

/// A requested walltime, validated against the `HH:MM:SS` format.
///
/// Hours may exceed 23 (e.g. `48:00:00` for a two-day allocation); minutes
/// and seconds must stay below 60.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime {
    seconds: u64,
}

impl Walltime {
    /// Create a walltime from a number of seconds
    pub fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    /// Total number of seconds
    pub fn as_secs(&self) -> u64 {
        self.seconds
    }

    /// Convert into a standard duration
    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl FromStr for Walltime {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.len() != 2 && p.len() != 3) {
            return Err(WorkflowError::description(format!(
                "duration \"{value}\" must have the format \"HH:MM:SS\""
            )));
        }
        let mut fields = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            fields[i] = part.parse().map_err(|_| {
                WorkflowError::description(format!(
                    "duration \"{value}\" must have the format \"HH:MM:SS\""
                ))
            })?;
        }
        let [hours, minutes, seconds] = fields;
        if minutes > 59 || seconds > 59 {
            return Err(WorkflowError::description(format!(
                "duration \"{value}\": minutes and seconds must be below 60"
            )));
        }
        Ok(Self {
            seconds: hours * 3600 + minutes * 60 + seconds,
        })
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.seconds / 3600;
        let minutes = (self.seconds % 3600) / 60;
        let seconds = self.seconds % 60;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02}")
    }
}

impl TryFrom<String> for Walltime {
    type Error = WorkflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

/// Format an elapsed duration for progress logs (`H:MM:SS`)
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
