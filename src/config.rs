use anyhow::{Context, Result};
use glob::glob;
use std::path::{Path, PathBuf};

use crate::phaseflow_config::PhaseflowToml;

pub const STATE_DIR: &str = ".phaseflow";

/// Runtime configuration.
///
/// Derives every on-disk location from the project directory and carries
/// the parsed `phaseflow.toml`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub flows_file: PathBuf,
    pub gates_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub log_dir: PathBuf,
    pub settings: PhaseflowToml,
}

impl Config {
    /// Resolve paths under `<project_dir>/.phaseflow`. The flow file is the
    /// given path, or the first `flows.{json,yaml,yml}` found.
    pub fn new(project_dir: PathBuf, flows_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let settings = PhaseflowToml::load_or_default(&state_dir)?;

        let flows_file = match flows_file {
            Some(path) if path.is_absolute() => path,
            Some(path) => project_dir.join(path),
            None => Self::find_flows_file(&state_dir)?,
        };

        Ok(Self {
            gates_dir: state_dir.join("gates"),
            artifacts_dir: state_dir.join("artifacts"),
            log_dir: state_dir.join("logs"),
            project_dir,
            state_dir,
            flows_file,
            settings,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.gates_dir).context("Failed to create gates directory")?;
        std::fs::create_dir_all(&self.artifacts_dir)
            .context("Failed to create artifacts directory")?;
        Ok(())
    }

    /// `flows.json` if present, else any `flows.yaml`/`flows.yml`. Falls
    /// back to the `flows.json` path so the error names the expected file.
    fn find_flows_file(state_dir: &Path) -> Result<PathBuf> {
        let json = state_dir.join("flows.json");
        if json.exists() {
            return Ok(json);
        }

        let pattern = state_dir.join("flows.y*ml").to_string_lossy().to_string();
        let mut candidates: Vec<PathBuf> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .collect();
        candidates.sort();

        Ok(candidates.into_iter().next().unwrap_or(json))
    }
}
