pub mod storage;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub duration: Option<f64>,
    pub succeeded: bool,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Local>,
    pub title: String,
    pub command: String,
    pub duration: f64,
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_code: Option<String>,
    pub error_count: usize,
    pub warning_count: usize,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub reporter_faults: usize,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
}

impl RunRecord {
    pub fn new(title: String, command: String) -> Self {
        Self {
            timestamp: Local::now(),
            title,
            command,
            duration: 0.0,
            success: false,
            exit_code: None,
            error_code: None,
            error_count: 0,
            warning_count: 0,
            steps: Vec::new(),
            reporter_faults: 0,
            git_commit: None,
            git_branch: None,
        }
    }

    /// Records the commit and branch checked out in `dir` (the current
    /// directory when `None`).
    pub fn with_git_info(mut self, dir: Option<&Path>) -> Self {
        self.git_commit = git_output(dir, &["rev-parse", "HEAD"]);
        self.git_branch = git_output(dir, &["rev-parse", "--abbrev-ref", "HEAD"]);
        self
    }

    pub fn add_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| !s.succeeded)
    }
}

/// Bounded, file-backed list of past runs, oldest first.
pub struct RunHistory {
    entries: Vec<RunRecord>,
    storage_path: PathBuf,
    max_runs: usize,
}

impl RunHistory {
    pub fn new(storage_path: PathBuf, max_runs: usize) -> anyhow::Result<Self> {
        let entries = storage::load_history(&storage_path)?;
        Ok(Self {
            entries,
            storage_path,
            max_runs,
        })
    }

    pub fn add_entry(&mut self, entry: RunRecord) -> anyhow::Result<()> {
        self.entries.push(entry);

        if self.entries.len() > self.max_runs {
            let excess = self.entries.len() - self.max_runs;
            self.entries.drain(..excess);
        }

        storage::save_history(&self.storage_path, &self.entries)
    }

    pub fn entries(&self) -> &[RunRecord] {
        &self.entries
    }

    pub fn last_entry(&self) -> Option<&RunRecord> {
        self.entries.last()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        storage::save_history(&self.storage_path, &self.entries)
    }
}

fn git_output(dir: Option<&Path>, args: &[&str]) -> Option<String> {
    let mut command = std::process::Command::new("git");
    command.args(args).stderr(std::process::Stdio::null());
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str) -> RunRecord {
        RunRecord::new(title.to_string(), "build".to_string())
    }

    #[test]
    fn test_history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut history = RunHistory::new(path.clone(), 2).unwrap();

        history.add_entry(record("one")).unwrap();
        history.add_entry(record("two")).unwrap();
        history.add_entry(record("three")).unwrap();

        let titles: Vec<&str> = history.entries().iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["two", "three"]);

        let reloaded = RunHistory::new(path, 2).unwrap();
        assert_eq!(reloaded.last_entry().map(|e| e.title.as_str()), Some("three"));
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/history.json");
        let mut history = RunHistory::new(path.clone(), 5).unwrap();
        history.add_entry(record("one")).unwrap();
        history.clear().unwrap();

        assert!(RunHistory::new(path, 5).unwrap().entries().is_empty());
    }

    #[test]
    fn test_git_info_outside_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let run = record("x").with_git_info(Some(&dir.path().join("missing")));

        assert_eq!(run.git_commit, None);
        assert_eq!(run.git_branch, None);
    }

    #[test]
    fn test_failed_steps() {
        let mut run = record("x");
        run.add_step(StepRecord {
            name: "Compile".to_string(),
            duration: Some(1.0),
            succeeded: true,
            status: Some("OK".to_string()),
        });
        run.add_step(StepRecord {
            name: "Link".to_string(),
            duration: None,
            succeeded: false,
            status: Some("FAILED".to_string()),
        });
        let failed: Vec<&str> = run.failed_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(failed, vec!["Link"]);
    }
}
