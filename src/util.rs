//! Shared utility functions for the phaseflow crate.

use regex::Regex;
use std::path::Path;

/// Directory name for a phase: any character outside `[A-Za-z0-9_-]`
/// becomes `_`, so the mapping is deterministic and path-safe.
pub fn phase_dir_name(phase_id: &str) -> String {
    let name: String = phase_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Highest attempt number among files in `dir` named like
/// `attempt-<n><suffix>`, together with its path.
pub fn latest_attempt_file(dir: &Path, suffix: &str) -> Option<(u32, std::path::PathBuf)> {
    let pattern = dir.join(format!("attempt-*{}", suffix));
    let re = Regex::new(&format!(r"^attempt-(\d+){}$", regex::escape(suffix))).ok()?;

    glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            let attempt = re.captures(&name)?.get(1)?.as_str().parse::<u32>().ok()?;
            Some((attempt, path))
        })
        .max_by_key(|(attempt, _)| *attempt)
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}
