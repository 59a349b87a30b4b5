//! Append-only transition journal, one JSON line per status change.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::status::ExperimentStatus;
use crate::core::types::Transition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub experiment_id: String,
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

impl JournalEntry {
    pub fn from_transition(experiment_id: &str, transition: &Transition) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            from: transition.from,
            to: transition.to,
            at: transition.at,
            reason: transition.reason.clone(),
        }
    }
}

pub fn append_entry(path: &Path, entry: &JournalEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(entry).context("serialize journal entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append journal {}", path.display()))
}

/// Read all entries; a missing journal reads as empty.
pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read journal {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse journal {} line {}", path.display(), idx + 1))
        })
        .collect()
}
