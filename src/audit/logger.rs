use super::{Event, EventType};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSON-lines event log.
///
/// Every append is flushed and synced before returning; a failed write is an
/// error for the caller, never a silent drop.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event_type: EventType, data: serde_json::Value) -> Result<Event> {
        let event = Event::new(event_type, data);
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .context("Failed to write event")?;
        file.sync_data().context("Failed to sync event log")?;

        Ok(event)
    }

    /// Read every event in append order.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read event log")?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Malformed event on line {}", i + 1))
            })
            .collect()
    }

    pub fn read_by_type(&self, event_type: EventType) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect())
    }

    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("Failed to remove event log")?;
        }
        Ok(())
    }
}
