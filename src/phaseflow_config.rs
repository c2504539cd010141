//! Project configuration read from `.phaseflow/phaseflow.toml`.
//!
//! Layering is file → environment. A missing file yields defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_iterations = 20
//! log_to_file = true
//!
//! [routing.categories]
//! STYLE_DEFECT = "Phase2"
//! GOAL_DEFECT = "none"
//!
//! [workers.claude]
//! command = "claude"
//! args = ["--print"]
//!
//! [gates.outline]
//! command = "scripts/check-outline.sh"
//! description = "Every section has a heading"
//! timeout_secs = 60
//! category = "STRUCTURE_DEFECT"
//! ```

use crate::agents::{AgentResolver, WorkerKind, WorkerSettings};
use crate::gates::GateSettings;
use crate::routing::{DEFAULT_MAX_ITERATIONS, RouteTable, RoutingPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const CONFIG_FILE: &str = "phaseflow.toml";

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Global cap on routing decisions per session
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Write a daily rolling log under `.phaseflow/logs`
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSection {
    /// Category name → phase id overrides of the default table
    #[serde(default)]
    pub categories: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseflowToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub workers: HashMap<String, WorkerSettings>,
    #[serde(default)]
    pub gates: HashMap<String, GateSettings>,
}

impl PhaseflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phaseflow.toml")
    }

    /// Load `phaseflow.toml` from the state directory, or defaults if absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize phaseflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Iteration cap, `PHASEFLOW_MAX_ITERATIONS` overriding the file.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations_with(std::env::var("PHASEFLOW_MAX_ITERATIONS").ok())
    }

    fn max_iterations_with(&self, env_value: Option<String>) -> u32 {
        env_value
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.orchestrator.max_iterations)
    }

    pub fn routing_policy(&self) -> Result<RoutingPolicy> {
        let table = RouteTable::with_overrides(&self.routing.categories)
            .context("Invalid [routing.categories] entry")?;
        Ok(RoutingPolicy::new(self.max_iterations(), table))
    }

    /// Command for a worker kind: `PHASEFLOW_<KIND>_CMD`, then the file, then
    /// the built-in default.
    pub fn worker_command(&self, kind: WorkerKind) -> Option<(String, Vec<String>)> {
        let env_key = format!("PHASEFLOW_{}_CMD", kind.as_str().to_uppercase());
        self.worker_command_with(kind, std::env::var(env_key).ok())
    }

    fn worker_command_with(
        &self,
        kind: WorkerKind,
        env_value: Option<String>,
    ) -> Option<(String, Vec<String>)> {
        let (default_cmd, default_args) = kind.default_command()?;
        let settings = self.workers.get(kind.as_str());

        let command = env_value
            .filter(|v| !v.trim().is_empty())
            .or_else(|| settings.and_then(|s| s.command.clone()))
            .unwrap_or(default_cmd);
        let args = settings
            .and_then(|s| s.args.clone())
            .unwrap_or(default_args);
        Some((command, args))
    }

    pub fn agent_resolver(&self, working_dir: &Path) -> AgentResolver {
        let mut resolver = AgentResolver::new(working_dir);
        for kind in WorkerKind::ALL {
            if let Some((command, args)) = self.worker_command(kind) {
                resolver.set_command(kind, command, args);
            }
        }
        resolver
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_iterations == 0 {
            warnings.push(
                "max_iterations is 0: every routing decision will escalate".to_string(),
            );
        }

        for category in self.routing.categories.keys() {
            if category.parse::<crate::gates::DefectCategory>().is_err() {
                warnings.push(format!(
                    "Unknown defect category '{}' in [routing.categories]",
                    category
                ));
            }
        }

        for name in self.workers.keys() {
            let known = WorkerKind::ALL.iter().any(|k| k.as_str() == name);
            if !known {
                warnings.push(format!("Unknown worker kind '{}' in [workers]", name));
            } else if name == WorkerKind::Manual.as_str() {
                warnings.push("[workers.manual] is ignored; the manual worker has no command".to_string());
            }
        }

        for (key, gate) in &self.gates {
            if gate.command.trim().is_empty() {
                warnings.push(format!("Gate '{}' has an empty command", key));
            }
            if gate.timeout_secs == 0 {
                warnings.push(format!("Gate '{}' has a zero timeout", key));
            }
        }

        warnings.sort();
        warnings
    }
}
