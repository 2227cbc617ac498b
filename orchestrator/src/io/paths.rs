//! Canonical filesystem layout for orchestrator state.
//!
//! Everything lives under `.orchestrator/` in the target project. Sandboxes
//! are worktrees under `sandboxes/`, named deterministically from the run id.

use std::path::{Path, PathBuf};

/// Paths rooted at the target project.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub home_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub sandboxes_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub journal_path: PathBuf,
    pub board_dir: PathBuf,
    pub settings_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let home_dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            runs_dir: home_dir.join("runs"),
            sandboxes_dir: home_dir.join("sandboxes"),
            logs_dir: home_dir.join("logs"),
            journal_path: home_dir.join("progress.txt"),
            board_dir: home_dir.join("board"),
            settings_path: home_dir.join("settings.toml"),
            home_dir,
        }
    }

    pub fn sandbox_dir(&self, run_id: &str) -> PathBuf {
        self.sandboxes_dir.join(run_id)
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{run_id}.log"))
    }
}

/// Orchestration artifacts inside a sandbox, relative to the worktree root.
///
/// These are the paths marked skip-worktree after checkout so agent commits
/// never carry them.
pub const SANDBOX_TASKS_REL: &str = ".orchestrator/tasks.json";
pub const SANDBOX_SETTINGS_REL: &str = ".orchestrator/settings.toml";
pub const SANDBOX_PROGRESS_REL: &str = ".orchestrator/progress.log";

#[derive(Debug, Clone)]
pub struct SandboxPaths {
    pub dir: PathBuf,
    pub tasks_path: PathBuf,
    pub settings_path: PathBuf,
    pub progress_log_path: PathBuf,
}

impl SandboxPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            tasks_path: dir.join(SANDBOX_TASKS_REL),
            settings_path: dir.join(SANDBOX_SETTINGS_REL),
            progress_log_path: dir.join(SANDBOX_PROGRESS_REL),
            dir,
        }
    }
}
