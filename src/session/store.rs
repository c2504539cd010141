use super::{DefinitionsRef, Session};
use crate::audit::{Event, EventLog, EventType};
use crate::errors::WorkflowError;
use crate::phase::PhaseDefinition;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable storage for one workflow session and its event log.
///
/// `save` overwrites the whole record and `append_event` adds one line; both
/// write through to disk before returning.
pub struct SessionStore {
    session_file: PathBuf,
    lock_file: PathBuf,
    events: EventLog,
}

impl SessionStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            session_file: state_dir.join("session.json"),
            lock_file: state_dir.join("session.lock"),
            events: EventLog::new(&state_dir.join("events.jsonl")),
        }
    }

    pub fn exists(&self) -> bool {
        self.session_file.exists()
    }

    /// Create and persist a new session for `flow_key`, recording
    /// `session_initialized`.
    pub fn init(
        &self,
        flow_key: &str,
        phases: &[PhaseDefinition],
        definitions: DefinitionsRef,
    ) -> crate::errors::Result<Session> {
        if phases.is_empty() {
            return Err(WorkflowError::EmptyFlow {
                flow_key: flow_key.to_string(),
            });
        }
        if self.exists() {
            return Err(WorkflowError::SessionExists {
                path: self.session_file.clone(),
            });
        }
        if let Some(parent) = self.session_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let mut session = Session::new(flow_key, phases, definitions);
        self.save(&mut session)?;
        self.append_event(
            EventType::SessionInitialized,
            serde_json::json!({
                "session_id": session.session_id,
                "flow_key": session.flow_key,
                "phases": session.phase_order,
                "current_phase": session.current_phase,
                "definitions": session.definitions,
            }),
        )?;

        Ok(session)
    }

    pub fn load(&self) -> Result<Option<Session>> {
        if !self.session_file.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.session_file).context("Failed to read session file")?;
        let session = serde_json::from_str(&content).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    /// Load the session or fail with `NoSession`.
    pub fn load_required(&self) -> crate::errors::Result<Session> {
        self.load()?.ok_or_else(|| WorkflowError::NoSession {
            path: self.session_file.clone(),
        })
    }

    /// Overwrite the persisted session.
    ///
    /// The persisted version must equal `session.version`; otherwise another
    /// writer saved in between and this save is rejected. On success the
    /// version is bumped in place.
    pub fn save(&self, session: &mut Session) -> crate::errors::Result<()> {
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .context("Failed to open session lock")?;
        FileExt::lock_exclusive(&lock).context("Failed to lock session")?;

        let result = self.save_locked(session);

        FileExt::unlock(&lock).context("Failed to unlock session")?;
        result
    }

    fn save_locked(&self, session: &mut Session) -> crate::errors::Result<()> {
        let persisted = self.load()?.map(|s| s.version).unwrap_or(0);
        if persisted != session.version {
            return Err(WorkflowError::StaleSession {
                expected: session.version,
                found: persisted,
            });
        }

        session.version += 1;
        let json = serde_json::to_string_pretty(&*session).context("Failed to serialize session")?;

        let tmp = self.session_file.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).context("Failed to create session temp file")?;
        file.write_all(json.as_bytes())
            .context("Failed to write session file")?;
        file.sync_all().context("Failed to sync session file")?;
        fs::rename(&tmp, &self.session_file).context("Failed to replace session file")?;

        debug!(
            session_id = %session.session_id,
            version = session.version,
            "session saved"
        );
        Ok(())
    }

    pub fn append_event(&self, event_type: EventType, data: serde_json::Value) -> Result<Event> {
        self.events.append(event_type, data)
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        self.events.read_all()
    }

    pub fn events_by_type(&self, event_type: EventType) -> Result<Vec<Event>> {
        self.events.read_by_type(event_type)
    }

    /// Remove the session and its log. Operator action; the orchestrator
    /// never calls this.
    pub fn reset(&self) -> Result<()> {
        if self.session_file.exists() {
            fs::remove_file(&self.session_file).context("Failed to remove session file")?;
        }
        self.events.reset()
    }
}
