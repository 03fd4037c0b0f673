//! Append-only record of every command submitted to a sandbox.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::Stage;

/// How a submitted command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The process (or builtin) ran to completion.
    Completed { exit_code: i32 },
    /// The command policy refused it; nothing was spawned.
    Rejected { stage: Stage, reason: String },
    /// The process was killed after exceeding the timeout.
    TimedOut { after_ms: u64 },
    /// The command was accepted but could not be run.
    Failed { reason: String },
}

impl CommandOutcome {
    /// Returns true if the command ran and exited with status zero.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed { exit_code: 0 })
    }
}

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Raw command string as submitted.
    pub command: String,
    /// Whether the command policy accepted it.
    pub accepted: bool,
    pub outcome: CommandOutcome,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl TranscriptEntry {
    /// Returns the duration as a Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Ordered, append-only command log for one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    /// Creates an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Entries are never removed or reordered.
    pub(crate) fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Number of recorded commands, accepted or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no command has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw command strings of accepted entries, in submission order.
    pub fn accepted_commands(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.accepted)
            .map(|e| e.command.as_str())
    }

    /// Writes the transcript as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::State(format!("failed to serialize transcript: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
