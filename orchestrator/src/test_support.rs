//! Test-only fixtures: throwaway git repositories with a seeded board, and a
//! scripted agent that replays predetermined iteration results.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::types::{Task, TaskBoard, TaskStatus};
use crate::io::agent::{AgentInvoker, AgentRequest, AgentResult};
use crate::io::paths::OrchestratorPaths;
use crate::io::task_store::{AutomationSettings, write_settings};

/// Run a git command in `root`, failing loudly on nonzero exit.
pub fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Stage all files and commit with the given message.
pub fn commit_all(root: &Path, message: &str) -> Result<()> {
    run_git(root, &["add", "-A"])?;
    run_git(root, &["commit", "-m", message])?;
    Ok(())
}

/// A throwaway git repository with one seed commit on `main`.
pub struct TestRepo {
    // Dropped last; deleting the directory kills the repo.
    _temp: TempDir,
    pub root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("create temp dir")?;
        let root = temp.path().to_path_buf();
        // -b main keeps the base-branch detection deterministic across git
        // versions with different init.defaultBranch settings.
        run_git(&root, &["init", "-b", "main"])?;
        run_git(&root, &["config", "user.name", "Orchestrator Test"])?;
        run_git(
            &root,
            &["config", "user.email", "orchestrator-test@local.invalid"],
        )?;
        std::fs::write(root.join("README.md"), "# fixture\n").context("write seed file")?;
        commit_all(&root, "chore: bootstrap fixture repo")?;
        Ok(Self { _temp: temp, root })
    }

    pub fn paths(&self) -> OrchestratorPaths {
        OrchestratorPaths::new(&self.root)
    }

    /// Write a sprint board file and commit it so sandboxes inherit it.
    pub fn seed_board(&self, sprint_id: &str, board: &TaskBoard) -> Result<()> {
        let path = self.paths().board_dir.join(format!("{sprint_id}.json"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create board dir")?;
        }
        let mut payload = serde_json::to_string_pretty(board).context("serialize board")?;
        payload.push('\n');
        std::fs::write(&path, payload).with_context(|| format!("write {}", path.display()))?;
        commit_all(&self.root, &format!("chore: seed board {sprint_id}"))?;
        Ok(())
    }

    /// Write automation settings and commit them.
    pub fn seed_settings(&self, settings: &AutomationSettings) -> Result<()> {
        write_settings(&self.paths().settings_path, settings)?;
        commit_all(&self.root, "chore: seed settings")?;
        Ok(())
    }
}

/// Create a deterministic task with the given status.
pub fn task(id: &str, status: TaskStatus) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        status,
        passes: false,
        failure_notes: None,
        files_touched: Vec::new(),
        last_run: None,
    }
}

/// Create a board named after the sprint with the given tasks.
pub fn board(sprint_name: &str, tasks: Vec<Task>) -> TaskBoard {
    TaskBoard {
        sprint_name: sprint_name.to_string(),
        tasks,
    }
}

type StepAction = Box<dyn Fn(&Path) -> Result<()> + Send>;

/// One scripted agent iteration: an exit code, canned output, and an
/// optional action run against the sandbox (editing files, rewriting the
/// task snapshot) before the result is returned.
pub struct ScriptedStep {
    pub exit_code: Option<i32>,
    pub output: String,
    pub action: Option<StepAction>,
}

impl ScriptedStep {
    pub fn ok(output: &str) -> Self {
        Self {
            exit_code: Some(0),
            output: output.to_string(),
            action: None,
        }
    }

    pub fn failing(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.to_string(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Fn(&Path) -> Result<()> + Send + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }
}

/// Agent double that replays scripted steps instead of spawning processes.
/// Panics (fails the test) when invoked more times than scripted.
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptedStep>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().expect("scripted agent lock").len()
    }
}

impl AgentInvoker for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResult> {
        let step = self
            .steps
            .lock()
            .expect("scripted agent lock")
            .pop_front()
            .expect("scripted agent invoked more times than scripted");
        if let Some(action) = &step.action {
            action(&request.workdir)?;
        }
        Ok(AgentResult {
            exit_code: step.exit_code,
            output: step.output,
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
