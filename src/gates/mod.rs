//! Gate execution.
//!
//! A gate is a named check run against a phase attempt. The executor is total
//! over its input: every requested key yields exactly one `GateResult`, and a
//! check that cannot be found or that errors becomes a failed result with
//! category `UNKNOWN` instead of aborting the batch.

use crate::util::{latest_attempt_file, phase_dir_name};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod command;
pub use command::{CommandGate, GateSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

/// Classification of a gate failure, used to pick a routing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefectCategory {
    GoalDefect,
    RequirementDefect,
    StructureDefect,
    ContentDefect,
    EvidenceDefect,
    StyleDefect,
    #[serde(other)]
    Unknown,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 7] = [
        DefectCategory::GoalDefect,
        DefectCategory::RequirementDefect,
        DefectCategory::StructureDefect,
        DefectCategory::ContentDefect,
        DefectCategory::EvidenceDefect,
        DefectCategory::StyleDefect,
        DefectCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectCategory::GoalDefect => "GOAL_DEFECT",
            DefectCategory::RequirementDefect => "REQUIREMENT_DEFECT",
            DefectCategory::StructureDefect => "STRUCTURE_DEFECT",
            DefectCategory::ContentDefect => "CONTENT_DEFECT",
            DefectCategory::EvidenceDefect => "EVIDENCE_DEFECT",
            DefectCategory::StyleDefect => "STYLE_DEFECT",
            DefectCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for DefectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DefectCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        DefectCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid defect category '{}'. Valid values: {}",
                    s,
                    DefectCategory::ALL.map(|c| c.as_str()).join(", ")
                )
            })
    }
}

/// Verdict of one gate for one phase attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    #[serde(default)]
    pub category: Option<DefectCategory>,
    pub reason: String,
    #[serde(default)]
    pub evidence_paths: Vec<PathBuf>,
    /// Advisory only; routing uses the category table.
    #[serde(default)]
    pub recommended_route: Option<String>,
}

impl GateResult {
    pub fn passed(gate_id: &str, reason: impl Into<String>) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            status: GateStatus::Passed,
            category: None,
            reason: reason.into(),
            evidence_paths: Vec::new(),
            recommended_route: None,
        }
    }

    pub fn failed(gate_id: &str, category: DefectCategory, reason: impl Into<String>) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            status: GateStatus::Failed,
            category: Some(category),
            reason: reason.into(),
            evidence_paths: Vec::new(),
            recommended_route: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == GateStatus::Failed
    }
}

/// What a check gets to look at.
#[derive(Debug, Clone, Serialize)]
pub struct GateContext {
    pub session_id: Uuid,
    pub phase_id: String,
    pub attempt: u32,
    pub project_dir: PathBuf,
    /// The worker output recorded for this attempt, if any
    pub output_file: Option<PathBuf>,
}

/// A named validation check.
#[async_trait]
pub trait GateCheck: Send + Sync {
    /// Stated purpose, shown to workers in the assembled prompt.
    fn description(&self) -> Option<&str> {
        None
    }

    async fn check(&self, gate_id: &str, ctx: &GateContext) -> Result<GateResult>;
}

/// Gate key → check.
#[derive(Default, Clone)]
pub struct GateRegistry {
    checks: HashMap<String, Arc<dyn GateCheck>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command gates from `[gates.<key>]` settings.
    pub fn from_settings(settings: &HashMap<String, GateSettings>, project_dir: &Path) -> Self {
        let mut registry = Self::new();
        for (key, gate) in settings {
            registry.register(key, CommandGate::new(gate.clone(), project_dir));
        }
        registry
    }

    pub fn register(&mut self, key: &str, check: impl GateCheck + 'static) {
        self.checks.insert(key.to_string(), Arc::new(check));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn GateCheck>> {
        self.checks.get(key).cloned()
    }

    pub fn describe(&self, key: &str) -> Option<String> {
        self.checks
            .get(key)
            .and_then(|c| c.description().map(str::to_string))
    }
}

/// Runs gate batches and persists each batch before returning it.
pub struct GateExecutor {
    registry: GateRegistry,
    results_dir: PathBuf,
}

impl GateExecutor {
    pub fn new(registry: GateRegistry, results_dir: &Path) -> Self {
        Self {
            registry,
            results_dir: results_dir.to_path_buf(),
        }
    }

    pub fn registry(&self) -> &GateRegistry {
        &self.registry
    }

    /// Run every gate in `gate_keys` in order. The returned list always has
    /// the same length and order as the input. Only a failure to persist the
    /// batch is an error.
    pub async fn run_all(&self, gate_keys: &[String], ctx: &GateContext) -> Result<Vec<GateResult>> {
        let mut results = Vec::with_capacity(gate_keys.len());

        for key in gate_keys {
            let result = match self.registry.get(key) {
                None => {
                    warn!(gate = %key, phase = %ctx.phase_id, "gate is not registered");
                    GateResult::failed(
                        key,
                        DefectCategory::Unknown,
                        format!("Gate '{}' could not be resolved", key),
                    )
                }
                Some(check) => match check.check(key, ctx).await {
                    Ok(mut result) => {
                        result.gate_id = key.clone();
                        result
                    }
                    Err(e) => {
                        warn!(gate = %key, phase = %ctx.phase_id, error = %e, "gate check errored");
                        GateResult::failed(
                            key,
                            DefectCategory::Unknown,
                            format!("Gate '{}' errored: {:#}", key, e),
                        )
                    }
                },
            };

            debug!(
                gate = %key,
                status = ?result.status,
                category = ?result.category,
                "gate evaluated"
            );
            results.push(result);
        }

        let path = self.persist(&ctx.phase_id, ctx.attempt, &results)?;
        info!(
            phase = %ctx.phase_id,
            attempt = ctx.attempt,
            failed = results.iter().filter(|r| r.is_failed()).count(),
            total = results.len(),
            batch = %path.display(),
            "gate batch complete"
        );

        Ok(results)
    }

    pub fn batch_path(&self, phase_id: &str, attempt: u32) -> PathBuf {
        self.results_dir
            .join(phase_dir_name(phase_id))
            .join(format!("attempt-{}.json", attempt))
    }

    /// Batches are immutable once written: an existing file for the same
    /// attempt is an error, never overwritten.
    fn persist(&self, phase_id: &str, attempt: u32, results: &[GateResult]) -> Result<PathBuf> {
        let path = self.batch_path(phase_id, attempt);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create gate results directory")?;
        }
        let json = serde_json::to_string_pretty(results).context("Failed to serialize gate batch")?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create gate batch {}", path.display()))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_data())
            .with_context(|| format!("Failed to write gate batch {}", path.display()))?;
        Ok(path)
    }

    pub fn load_batch(&self, phase_id: &str, attempt: u32) -> Result<Option<Vec<GateResult>>> {
        let path = self.batch_path(phase_id, attempt);
        if !path.exists() {
            return Ok(None);
        }
        read_batch(&path).map(Some)
    }

    /// Most recent batch recorded for a phase.
    pub fn latest_batch(&self, phase_id: &str) -> Result<Option<(u32, Vec<GateResult>)>> {
        let dir = self.results_dir.join(phase_dir_name(phase_id));
        match latest_attempt_file(&dir, ".json") {
            Some((attempt, path)) => Ok(Some((attempt, read_batch(&path)?))),
            None => Ok(None),
        }
    }
}

fn read_batch(path: &Path) -> Result<Vec<GateResult>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gate batch {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse gate batch {}", path.display()))
}
