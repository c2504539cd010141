//! Worker selection.
//!
//! A phase names its worker with a free-form selector ("claude-sonnet",
//! "codex", ...). The resolver maps the selector onto a `WorkerKind` by
//! case-insensitive substring match, checks that the executable can be
//! spawned and falls back to the manual worker when it cannot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod cli;
pub mod manual;

pub use cli::CliWorker;
pub use manual::ManualWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Claude,
    Codex,
    Gemini,
    Manual,
}

impl WorkerKind {
    /// Match order for selectors.
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Claude,
        WorkerKind::Codex,
        WorkerKind::Gemini,
        WorkerKind::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Claude => "claude",
            WorkerKind::Codex => "codex",
            WorkerKind::Gemini => "gemini",
            WorkerKind::Manual => "manual",
        }
    }

    /// First kind whose name occurs in `selector`; `Manual` if none does.
    pub fn from_selector(selector: &str) -> WorkerKind {
        let selector = selector.to_lowercase();
        WorkerKind::ALL
            .into_iter()
            .find(|kind| selector.contains(kind.as_str()))
            .unwrap_or(WorkerKind::Manual)
    }

    /// Default executable and arguments. The prompt is always sent on stdin.
    pub fn default_command(&self) -> Option<(String, Vec<String>)> {
        match self {
            WorkerKind::Claude => Some(("claude".to_string(), vec!["--print".to_string()])),
            WorkerKind::Codex => Some((
                "codex".to_string(),
                vec!["exec".to_string(), "-".to_string()],
            )),
            WorkerKind::Gemini => Some(("gemini".to_string(), Vec::new())),
            WorkerKind::Manual => None,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity passed to a worker alongside the prompt.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerContext {
    pub session_id: Uuid,
    pub phase_id: String,
    pub attempt: u32,
}

/// What a worker reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Completed { output: String },
    ManualRequired,
    Failed { message: String },
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Completed { .. } => "completed",
            WorkerStatus::ManualRequired => "manual_required",
            WorkerStatus::Failed { .. } => "failed",
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn is_available(&self) -> bool;

    /// Run the worker to completion. Never errors: anomalies come back as
    /// `WorkerStatus::Failed`.
    async fn execute(&self, prompt: &str, ctx: &WorkerContext) -> WorkerStatus;
}

/// `[workers.<kind>]` entry in `phaseflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

/// Picks the worker for a phase.
#[derive(Clone)]
pub struct AgentResolver {
    commands: HashMap<WorkerKind, (String, Vec<String>)>,
    overrides: HashMap<WorkerKind, Arc<dyn Worker>>,
    working_dir: PathBuf,
}

impl AgentResolver {
    /// Resolver using each kind's default command.
    pub fn new(working_dir: &Path) -> Self {
        let commands = WorkerKind::ALL
            .into_iter()
            .filter_map(|kind| kind.default_command().map(|cmd| (kind, cmd)))
            .collect();
        Self {
            commands,
            overrides: HashMap::new(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    /// Replace the command used for `kind`.
    pub fn set_command(&mut self, kind: WorkerKind, command: String, args: Vec<String>) {
        if kind != WorkerKind::Manual {
            self.commands.insert(kind, (command, args));
        }
    }

    /// Use `worker` whenever a selector resolves to `kind`.
    pub fn register(&mut self, kind: WorkerKind, worker: Arc<dyn Worker>) {
        self.overrides.insert(kind, worker);
    }

    pub fn command_for(&self, kind: WorkerKind) -> Option<&(String, Vec<String>)> {
        self.commands.get(&kind)
    }

    /// Resolve `selector` to a runnable worker. Always succeeds: an
    /// unavailable worker degrades to the manual one.
    pub async fn resolve(&self, selector: &str) -> Arc<dyn Worker> {
        let kind = WorkerKind::from_selector(selector);

        let candidate: Option<Arc<dyn Worker>> = if let Some(worker) = self.overrides.get(&kind) {
            Some(worker.clone())
        } else {
            self.commands.get(&kind).map(|(command, args)| {
                Arc::new(CliWorker::new(kind, command, args.clone(), &self.working_dir))
                    as Arc<dyn Worker>
            })
        };

        if let Some(worker) = candidate {
            if worker.is_available().await {
                debug!(selector, kind = %kind, "resolved worker");
                return worker;
            }
            warn!(selector, kind = %kind, "worker unavailable, falling back to manual");
        }

        Arc::new(ManualWorker)
    }
}
