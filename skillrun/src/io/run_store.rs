//! Filesystem-backed run directories and artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use tracing::debug;
use uuid::Uuid;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const DRY_RUN_PROMPT_FILE: &str = "dry_run_prompt.txt";
pub const FINAL_SUMMARY_FILE: &str = "final_summary.md";

/// `YYYYMMDD-HHMMSS-<8 hex>`.
pub fn generate_run_id() -> String {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

/// A run directory plus the artifact-name prefix used for this run's files.
///
/// Session runs share one directory and distinguish their artifacts by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStore {
    run_id: String,
    run_dir: PathBuf,
    artifact_prefix: Option<String>,
}

impl RunStore {
    /// Create (or reuse) `<base_dir>/<run_id>`.
    pub fn create(base_dir: &Path, run_id: &str, artifact_prefix: Option<&str>) -> Result<Self> {
        let run_dir = base_dir.join(run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run dir {}", run_dir.display()))?;
        debug!(run_dir = %run_dir.display(), "run directory ready");
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
            artifact_prefix: artifact_prefix
                .map(str::trim)
                .filter(|prefix| !prefix.is_empty())
                .map(str::to_string),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_dir.join(EVENTS_FILE)
    }

    /// Relative artifact path with the prefix inserted before the leaf name.
    pub fn artifact_name(&self, relative: &str) -> String {
        let Some(prefix) = &self.artifact_prefix else {
            return relative.to_string();
        };
        match relative.rsplit_once('/') {
            Some((dir, leaf)) => format!("{dir}/{prefix}{leaf}"),
            None => format!("{prefix}{relative}"),
        }
    }

    /// Write `content` to the prefixed artifact path, creating parents.
    pub fn write_artifact(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let name = self.artifact_name(relative);
        if Path::new(&name).is_absolute() || name.split('/').any(|part| part == "..") {
            return Err(anyhow!("artifact path must stay inside the run dir: {name}"));
        }
        let path = self.run_dir.join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write artifact {}", path.display()))?;
        Ok(path)
    }
}

/// Locate an existing run directory by id under `base_dir`.
pub fn find_run_dir(base_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let run_dir = base_dir.join(run_id);
    if !run_dir.is_dir() {
        return Err(anyhow!("run not found: {}", run_dir.display()));
    }
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_timestamp_and_short_suffix() {
        let run_id = generate_run_id();
        let parts: Vec<&str> = run_id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn prefix_is_inserted_before_leaf_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(temp.path(), "run-1", Some("task_002_")).expect("create");
        assert_eq!(
            store.artifact_name("artifacts/turn_1_step-1_stdout.txt"),
            "artifacts/task_002_turn_1_step-1_stdout.txt"
        );
        assert_eq!(store.artifact_name("final_summary.md"), "task_002_final_summary.md");

        let path = store
            .write_artifact("artifacts/llm/decision_turn_1_attempt_1_request.txt", "body")
            .expect("write");
        assert!(path.ends_with("artifacts/llm/task_002_decision_turn_1_attempt_1_request.txt"));
        assert_eq!(fs::read_to_string(path).expect("read"), "body");
    }

    #[test]
    fn rejects_escaping_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::create(temp.path(), "run-1", None).expect("create");
        assert!(store.write_artifact("../outside.txt", "x").is_err());
    }

    #[test]
    fn find_run_dir_requires_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        RunStore::create(temp.path(), "run-1", None).expect("create");
        assert!(find_run_dir(temp.path(), "run-1").is_ok());
        assert!(find_run_dir(temp.path(), "run-2").is_err());
    }
}
