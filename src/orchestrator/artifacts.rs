use crate::util::{latest_attempt_file, phase_dir_name};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Prompt and output files per phase attempt, under
/// `artifacts/<phase>/attempt-<n>-{prompt,output}.md`.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn phase_dir(&self, phase_id: &str) -> PathBuf {
        self.root.join(phase_dir_name(phase_id))
    }

    pub fn prompt_path(&self, phase_id: &str, attempt: u32) -> PathBuf {
        self.phase_dir(phase_id)
            .join(format!("attempt-{}-prompt.md", attempt))
    }

    pub fn output_path(&self, phase_id: &str, attempt: u32) -> PathBuf {
        self.phase_dir(phase_id)
            .join(format!("attempt-{}-output.md", attempt))
    }

    pub fn write_prompt(&self, phase_id: &str, attempt: u32, prompt: &str) -> Result<PathBuf> {
        write_file(&self.prompt_path(phase_id, attempt), prompt)
    }

    /// Outputs are write-once; an existing file for `attempt` is an error.
    pub fn write_output(&self, phase_id: &str, attempt: u32, output: &str) -> Result<PathBuf> {
        let path = self.output_path(phase_id, attempt);
        create_parent(&path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(output.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Newest recorded output for a phase, with its attempt number.
    pub fn latest_output(&self, phase_id: &str) -> Result<Option<(u32, String)>> {
        match latest_attempt_file(&self.phase_dir(phase_id), "-output.md") {
            Some((attempt, path)) => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(Some((attempt, content)))
            }
            None => Ok(None),
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create artifacts directory")?;
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<PathBuf> {
    create_parent(path)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_use_sanitized_phase() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert_eq!(
            store.prompt_path("Phase 1/a", 3),
            dir.path().join("Phase_1_a").join("attempt-3-prompt.md")
        );
    }

    #[test]
    fn test_latest_output_picks_highest_attempt() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.latest_output("Phase0A").unwrap().is_none());

        store.write_output("Phase0A", 2, "second").unwrap();
        store.write_output("Phase0A", 9, "ninth").unwrap();
        store.write_prompt("Phase0A", 12, "prompt only").unwrap();

        assert_eq!(
            store.latest_output("Phase0A").unwrap(),
            Some((9, "ninth".to_string()))
        );
    }

    #[test]
    fn test_output_is_write_once() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_output("Phase1", 1, "original").unwrap();
        assert!(store.write_output("Phase1", 1, "replacement").is_err());
        assert_eq!(
            store.latest_output("Phase1").unwrap(),
            Some((1, "original".to_string()))
        );
    }
}
