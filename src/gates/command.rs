//! Shell-command gates.
//!
//! A command gate spawns `sh -c <command>`, writes the `GateContext` as JSON
//! to stdin and reads a verdict back. A JSON object on stdout wins; otherwise
//! the exit code decides (0 passes, anything else fails with the configured
//! category).

use super::{DefectCategory, GateCheck, GateContext, GateResult, GateStatus};
use crate::util::extract_json_object;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

fn default_timeout() -> u64 {
    300
}

/// `[gates.<key>]` entry in `phaseflow.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Category reported when the command fails without a JSON verdict
    #[serde(default)]
    pub category: Option<DefectCategory>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl GateSettings {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: None,
            timeout_secs: default_timeout(),
            category: None,
            working_dir: None,
        }
    }
}

/// Verdict a gate command may print on stdout.
#[derive(Debug, Deserialize)]
struct CommandVerdict {
    passed: bool,
    #[serde(default)]
    category: Option<DefectCategory>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    evidence_paths: Vec<PathBuf>,
    #[serde(default)]
    recommended_route: Option<String>,
}

pub struct CommandGate {
    settings: GateSettings,
    project_dir: PathBuf,
}

impl CommandGate {
    pub fn new(settings: GateSettings, project_dir: &Path) -> Self {
        Self {
            settings,
            project_dir: project_dir.to_path_buf(),
        }
    }

    fn working_dir(&self) -> PathBuf {
        match &self.settings.working_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.project_dir.join(p),
            None => self.project_dir.clone(),
        }
    }

    fn parse_output(&self, gate_id: &str, output: &std::process::Output) -> GateResult {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(json) = extract_json_object(&stdout)
            && let Ok(verdict) = serde_json::from_str::<CommandVerdict>(&json)
        {
            return self.verdict_result(gate_id, verdict);
        }

        if output.status.success() {
            let reason = if stdout.trim().is_empty() {
                format!("Gate '{}' passed", gate_id)
            } else {
                stdout.trim().to_string()
            };
            return GateResult::passed(gate_id, reason);
        }

        let reason = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!(
                "Gate '{}' exited with code {}",
                gate_id,
                output.status.code().unwrap_or(-1)
            )
        };
        GateResult::failed(
            gate_id,
            self.settings.category.unwrap_or(DefectCategory::Unknown),
            reason,
        )
    }

    fn verdict_result(&self, gate_id: &str, verdict: CommandVerdict) -> GateResult {
        let (status, category) = if verdict.passed {
            (GateStatus::Passed, None)
        } else {
            let category = verdict
                .category
                .or(self.settings.category)
                .unwrap_or(DefectCategory::Unknown);
            (GateStatus::Failed, Some(category))
        };
        GateResult {
            gate_id: gate_id.to_string(),
            status,
            category,
            reason: verdict.reason.unwrap_or_default(),
            evidence_paths: verdict.evidence_paths,
            recommended_route: verdict.recommended_route,
        }
    }
}

#[async_trait]
impl GateCheck for CommandGate {
    fn description(&self) -> Option<&str> {
        self.settings.description.as_deref()
    }

    async fn check(&self, gate_id: &str, ctx: &GateContext) -> Result<GateResult> {
        let command = &self.settings.command;
        let context_json =
            serde_json::to_string(ctx).context("Failed to serialize gate context to JSON")?;

        debug!(gate = gate_id, command = %command, timeout_secs = self.settings.timeout_secs, "running gate command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PHASEFLOW_SESSION_ID", ctx.session_id.to_string())
            .env("PHASEFLOW_PHASE", &ctx.phase_id)
            .env("PHASEFLOW_ATTEMPT", ctx.attempt.to_string())
            .env(
                "PHASEFLOW_OUTPUT_FILE",
                ctx.output_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            )
            .spawn()
            .with_context(|| format!("Failed to spawn gate command: {}", command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that never reads stdin closes the pipe early; that is
            // not a gate failure.
            let _ = stdin.write_all(context_json.as_bytes()).await;
        }

        let duration = Duration::from_secs(self.settings.timeout_secs);
        let output = match timeout(duration, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for gate command")?,
            Err(_) => {
                return Ok(GateResult::failed(
                    gate_id,
                    DefectCategory::Unknown,
                    format!(
                        "Gate '{}' timed out after {} seconds",
                        gate_id, self.settings.timeout_secs
                    ),
                ));
            }
        };

        Ok(self.parse_output(gate_id, &output))
    }
}
