//! Task storage collaborator.
//!
//! The CRUD layer owns tasks; the orchestrator consumes them through the
//! [`TaskStore`] trait so tests (and alternative backends) can substitute
//! their own. The filesystem implementation keeps one JSON board per sprint
//! and a human-edited TOML settings file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::settings::AgentSettings;
use crate::core::types::TaskBoard;
use crate::io::paths::OrchestratorPaths;

/// Automation configuration for a project (`.orchestrator/settings.toml`).
///
/// Intended to be edited by humans; missing fields default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationSettings {
    /// Shell commands run once in the sandbox before the first iteration
    /// (dependency install, codegen).
    pub setup_commands: Vec<String>,
    pub agent: AgentSettings,
    pub max_iterations: Option<u32>,
    /// Image for the docker executor mode. Required when that mode is used.
    pub docker_image: Option<String>,
    pub setup_timeout_secs: Option<u64>,
}

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_SETUP_TIMEOUT_SECS: u64 = 120;

impl AutomationSettings {
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    pub fn setup_timeout_secs(&self) -> u64 {
        self.setup_timeout_secs.unwrap_or(DEFAULT_SETUP_TIMEOUT_SECS)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.max_iterations {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if let Some(0) = self.setup_timeout_secs {
            return Err(anyhow!("setup_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Read/write access to sprint boards and automation settings.
pub trait TaskStore {
    fn read_task_set(&self, sprint_id: &str) -> Result<TaskBoard>;
    fn write_task_set(&self, sprint_id: &str, board: &TaskBoard) -> Result<()>;
    fn read_automation_settings(&self) -> Result<AutomationSettings>;
}

/// Filesystem-backed store under `.orchestrator/`.
#[derive(Debug, Clone)]
pub struct FsTaskStore {
    paths: OrchestratorPaths,
}

impl FsTaskStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: OrchestratorPaths::new(project_root),
        }
    }

    pub fn board_path(&self, sprint_id: &str) -> PathBuf {
        self.paths.board_dir.join(format!("{sprint_id}.json"))
    }
}

impl TaskStore for FsTaskStore {
    fn read_task_set(&self, sprint_id: &str) -> Result<TaskBoard> {
        let path = self.board_path(sprint_id);
        debug!(path = %path.display(), "loading task board");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read task board {}", path.display()))?;
        let board: TaskBoard = serde_json::from_str(&contents)
            .with_context(|| format!("parse task board {}", path.display()))?;
        Ok(board)
    }

    fn write_task_set(&self, sprint_id: &str, board: &TaskBoard) -> Result<()> {
        let path = self.board_path(sprint_id);
        debug!(path = %path.display(), tasks = board.tasks.len(), "writing task board");
        let mut buf = serde_json::to_string_pretty(board)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn read_automation_settings(&self) -> Result<AutomationSettings> {
        load_settings(&self.paths.settings_path)
    }
}

/// Load settings from a TOML file. Missing file means defaults.
pub fn load_settings(path: &Path) -> Result<AutomationSettings> {
    if !path.exists() {
        let settings = AutomationSettings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: AutomationSettings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &AutomationSettings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Task, TaskStatus};

    #[test]
    fn board_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsTaskStore::new(temp.path());
        let board = TaskBoard {
            sprint_name: "Sprint 1".to_string(),
            tasks: vec![Task {
                id: "t1".to_string(),
                title: "first".to_string(),
                status: TaskStatus::Todo,
                passes: false,
                failure_notes: None,
                files_touched: Vec::new(),
                last_run: None,
            }],
        };

        store.write_task_set("sprint-1", &board).expect("write");
        let loaded = store.read_task_set("sprint-1").expect("read");
        assert_eq!(loaded, board);
    }

    #[test]
    fn missing_settings_returns_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsTaskStore::new(temp.path());
        let settings = store.read_automation_settings().expect("settings");
        assert_eq!(settings, AutomationSettings::default());
        assert_eq!(settings.max_iterations(), DEFAULT_MAX_ITERATIONS);
        assert_eq!(settings.setup_timeout_secs(), DEFAULT_SETUP_TIMEOUT_SECS);
    }

    #[test]
    fn settings_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        let settings = AutomationSettings {
            setup_commands: vec!["npm install".to_string()],
            max_iterations: Some(3),
            ..AutomationSettings::default()
        };

        write_settings(&path, &settings).expect("write");
        let loaded = load_settings(&path).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        let settings = AutomationSettings {
            max_iterations: Some(0),
            ..AutomationSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
