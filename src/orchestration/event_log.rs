//! JSONL event log for session replay.
//!
//! Every event on the bus is written as one JSON line to a timestamped file
//! stored alongside the workspace directory (not inside it):
//! `{workspace_parent}/.federation-logs/session-{ISO8601}.jsonl`.
//!
//! Uses synchronous `std::fs` since writes are small, buffered, and flushed
//! after each event. Write failures are logged and never reach the emitter.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;

use super::events::{Event, EventBus, SubscriptionToken};

/// Returns the current UTC time as an ISO 8601 string with milliseconds.
fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// One line of the log, tagged with `event_type` so each line is
/// self-describing.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum LogRecord<'a> {
    SessionStart {
        timestamp: String,
        model: &'a str,
        workspace: String,
    },
    Event(&'a Event),
    SessionEnd {
        timestamp: String,
        reason: &'a str,
    },
}

/// Append-only JSONL writer shared with the bus subscription.
#[derive(Clone)]
pub struct EventLog {
    writer: Arc<Mutex<BufWriter<fs::File>>>,
    log_path: PathBuf,
}

impl EventLog {
    /// Create a new session log for the given workspace path.
    pub fn new(workspace_path: &Path) -> anyhow::Result<Self> {
        let log_dir = Self::log_dir_for(workspace_path)?;
        fs::create_dir_all(&log_dir)?;

        let session_id = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        let log_path = log_dir.join(format!("session-{session_id}.jsonl"));

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            log_path,
        })
    }

    /// Returns `{workspace_parent}/.federation-logs/`.
    fn log_dir_for(workspace_path: &Path) -> anyhow::Result<PathBuf> {
        let parent = workspace_path.parent().ok_or_else(|| {
            anyhow::anyhow!(
                "Workspace path '{}' has no parent directory",
                workspace_path.display()
            )
        })?;
        Ok(parent.join(".federation-logs"))
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn write(&self, record: &LogRecord<'_>) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn log_event(&self, event: &Event) -> anyhow::Result<()> {
        self.write(&LogRecord::Event(event))
    }

    pub fn log_session_start(&self, model: &str, workspace: &Path) -> anyhow::Result<()> {
        self.write(&LogRecord::SessionStart {
            timestamp: now_iso(),
            model,
            workspace: workspace.display().to_string(),
        })
    }

    pub fn log_session_end(&self, reason: &str) -> anyhow::Result<()> {
        self.write(&LogRecord::SessionEnd {
            timestamp: now_iso(),
            reason,
        })
    }

    /// Subscribe this log to every event on `bus`.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionToken {
        let log = self.clone();
        bus.subscribe(move |event| {
            if let Err(e) = log.log_event(event) {
                tracing::warn!(path = %log.log_path.display(), error = %e, "Failed to write event log");
            }
        })
    }
}
