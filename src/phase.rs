//! Phase definitions and flow file loading.
//!
//! This module provides:
//! - `PhaseDefinition`, one ordered stage of a flow
//! - `FlowsFile`, the mapping from flow key to its ordered phase list
//!
//! Flow files are produced by an external compiler; phaseflow only consumes
//! them. Both JSON and YAML encodings are accepted, selected by extension.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::util::phase_dir_name;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

fn default_max_retries() -> u32 {
    3
}

/// A single phase of a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Phase identifier (e.g., "Phase0A", "Phase1")
    pub id: String,
    /// Gate keys that must pass before the phase advances
    #[serde(default)]
    pub required_gates: Vec<String>,
    /// Worker selector, matched by substring against known worker names
    #[serde(default)]
    pub worker: String,
    /// Key of the prompt template this phase is authored against
    #[serde(default)]
    pub prompt_key: String,
    /// Same-phase retry budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Free-text iteration guidance, echoed into the prompt verbatim
    #[serde(default)]
    pub iteration_rule: String,
    /// Free-text constraints, echoed into the prompt verbatim
    #[serde(default)]
    pub constraint_rule: String,
}

impl PhaseDefinition {
    pub fn new(id: &str, worker: &str, required_gates: Vec<String>, max_retries: u32) -> Self {
        Self {
            id: id.to_string(),
            required_gates,
            worker: worker.to_string(),
            prompt_key: id.to_lowercase(),
            max_retries,
            iteration_rule: String::new(),
            constraint_rule: String::new(),
        }
    }

    pub fn with_rules(mut self, iteration_rule: &str, constraint_rule: &str) -> Self {
        self.iteration_rule = iteration_rule.to_string();
        self.constraint_rule = constraint_rule.to_string();
        self
    }
}

/// The full flow definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowsFile {
    pub flows: BTreeMap<String, Vec<PhaseDefinition>>,
}

impl FlowsFile {
    /// Load flows from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flows file: {}", path.display()))?;

        if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse flows YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse flows JSON: {}", path.display()))
        }
    }

    /// Save flows, encoding by extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = if is_yaml(path) {
            serde_yaml::to_string(self).context("Failed to serialize flows to YAML")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize flows to JSON")?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write flows file: {}", path.display()))?;

        Ok(())
    }

    /// Ordered phases for a flow, if defined.
    pub fn phases(&self, flow_key: &str) -> Option<&[PhaseDefinition]> {
        self.flows.get(flow_key).map(Vec::as_slice)
    }

    /// Look up one phase of a flow.
    pub fn get_phase(&self, flow_key: &str, phase_id: &str) -> Option<&PhaseDefinition> {
        self.phases(flow_key)?.iter().find(|p| p.id == phase_id)
    }

    /// Duplicate phase ids within a flow make the canonical order ambiguous.
    /// Distinct ids that sanitise to the same directory name would share
    /// artifact and gate batch files.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, phases) in &self.flows {
            if phases.is_empty() {
                warnings.push(format!("Flow '{}' has no phases", key));
            }
            let mut seen = HashSet::new();
            let mut dirs: HashMap<String, &str> = HashMap::new();
            for phase in phases {
                if !seen.insert(phase.id.as_str()) {
                    warnings.push(format!("Flow '{}' declares phase '{}' twice", key, phase.id));
                    continue;
                }
                let dir = phase_dir_name(&phase.id);
                if let Some(other) = dirs.get(&dir) {
                    warnings.push(format!(
                        "Flow '{}': phases '{}' and '{}' share the directory name '{}'",
                        key, other, phase.id, dir
                    ));
                } else {
                    dirs.insert(dir, &phase.id);
                }
            }
        }
        warnings
    }
}

/// SHA-256 of a definition file, hex encoded. Stamped onto sessions so a
/// changed definition set can be detected on later operations.
pub fn definitions_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read flows file: {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
