//! Sandbox (worktree) lifecycle: checkout, plan preparation, auto-save,
//! safe-deletion analysis, push/PR, and the finalize decision tree.
//!
//! A sandbox is a git worktree on its own branch plus a filtered task
//! snapshot, a settings copy, and a progress log. It is exclusively owned by
//! one orchestrator process for the run's duration. Lifecycle:
//! `absent -> checked_out -> plan_prepared -> iterations -> finalize -> {deleted, preserved}`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::branch::validate_branch_name;
use crate::core::types::{Task, TaskBoard};
use crate::io::git::Git;
use crate::io::paths::{
    SANDBOX_PROGRESS_REL, SANDBOX_SETTINGS_REL, SANDBOX_TASKS_REL, SandboxPaths,
};
use crate::io::process::{CommandRequest, CommandRunner, Invocation};
use crate::io::progress_log::{append_block, init_progress_log};
use crate::io::task_store::{TaskStore, write_settings};

const REMOTE: &str = "origin";

/// What prepare_sandbox_plan produced.
#[derive(Debug, Clone)]
pub struct SandboxPlan {
    pub sprint_name: String,
    /// The filtered pending snapshot written into the sandbox.
    pub pending: Vec<Task>,
}

/// Whether setup ran to completion or was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    Completed,
    Canceled,
}

/// Result of the finalize decision tree. Callers must not assume cleanup
/// happened: a preserved sandbox is a valid, reported outcome.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOutcome {
    pub pr_url: Option<String>,
    pub cleaned_up: bool,
    pub worktree_preserved: bool,
    /// Human-readable notes (preserved paths, manual recovery commands).
    pub notes: Vec<String>,
}

/// Owns one run's sandbox.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo_root: PathBuf,
    paths: SandboxPaths,
    branch: String,
    run_id: String,
}

impl WorkspaceManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        sandbox_dir: impl Into<PathBuf>,
        branch: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            paths: SandboxPaths::new(sandbox_dir),
            branch: branch.into(),
            run_id: run_id.into(),
        }
    }

    pub fn sandbox_paths(&self) -> &SandboxPaths {
        &self.paths
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn repo_git(&self) -> Git {
        Git::new(&self.repo_root)
    }

    fn sandbox_git(&self) -> Git {
        Git::new(&self.paths.dir)
    }

    /// Check out the branch-backed worktree for this run.
    ///
    /// Idempotent under retry: a stale worktree at the same path is
    /// force-removed first. Attaches to the branch when it already exists,
    /// otherwise creates it at HEAD.
    #[instrument(skip_all, fields(run_id = %self.run_id, branch = %self.branch))]
    pub fn checkout_workspace(&self) -> Result<()> {
        validate_branch_name(&self.branch).map_err(|msg| anyhow!(msg))?;
        let parent = self
            .paths
            .dir
            .parent()
            .ok_or_else(|| anyhow!("sandbox path has no parent"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create sandboxes dir {}", parent.display()))?;

        let repo = self.repo_git();
        if self.paths.dir.exists() {
            warn!(path = %self.paths.dir.display(), "removing stale sandbox worktree");
            if let Err(err) = repo.worktree_remove_force(&self.paths.dir) {
                debug!(%err, "worktree remove failed, deleting directory directly");
                fs::remove_dir_all(&self.paths.dir)
                    .with_context(|| format!("remove stale sandbox {}", self.paths.dir.display()))?;
            }
        }
        // Stale registrations from crashed runs would make worktree add fail.
        if let Err(err) = repo.worktree_prune() {
            debug!(%err, "worktree prune failed");
        }

        if repo.branch_exists(&self.branch)? {
            info!("attaching worktree to existing branch");
            repo.worktree_add_existing(&self.paths.dir, &self.branch)
                .with_context(|| format!("attach worktree for branch {}", self.branch))?;
        } else {
            info!("creating branch and worktree");
            repo.worktree_add_new(&self.paths.dir, &self.branch)
                .with_context(|| format!("create worktree for branch {}", self.branch))?;
        }
        Ok(())
    }

    /// Write the filtered pending-task snapshot, settings copy, and progress
    /// log into the sandbox, then exempt those paths from agent commits.
    ///
    /// The filter is the authorization boundary: the agent only ever sees
    /// pending work, never done/backlog/review tasks.
    #[instrument(skip_all, fields(run_id = %self.run_id, sprint_id))]
    pub fn prepare_sandbox_plan(
        &self,
        store: &dyn TaskStore,
        sprint_id: &str,
    ) -> Result<SandboxPlan> {
        let board = store.read_task_set(sprint_id)?;
        let pending = board.pending();
        debug!(
            total = board.tasks.len(),
            pending = pending.len(),
            "filtered task board into sandbox"
        );

        let snapshot = TaskBoard {
            sprint_name: board.sprint_name.clone(),
            tasks: pending.clone(),
        };
        write_json(&self.paths.tasks_path, &snapshot)?;

        let settings = store.read_automation_settings()?;
        write_settings(&self.paths.settings_path, &settings)?;

        init_progress_log(&self.paths.progress_log_path, &self.run_id)?;

        // Snapshot state must never ride along in agent commits. Tracked
        // paths get skip-worktree (an ignore rule cannot hide index entries);
        // untracked paths go into the shared info/exclude instead.
        let git = self.sandbox_git();
        for rel in [SANDBOX_TASKS_REL, SANDBOX_SETTINGS_REL, SANDBOX_PROGRESS_REL] {
            match git.skip_worktree(rel) {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = git.add_to_exclude(rel) {
                        warn!(path = rel, %err, "exclude rule failed");
                    }
                }
                Err(err) => warn!(path = rel, %err, "skip-worktree failed"),
            }
        }

        Ok(SandboxPlan {
            sprint_name: board.sprint_name,
            pending,
        })
    }

    /// Run the configured setup commands sequentially inside the sandbox.
    ///
    /// Aborts on the first failing command; checks for cancellation between
    /// commands (never mid-command). No commands is a valid no-op.
    #[instrument(skip_all, fields(run_id = %self.run_id, commands = commands.len()))]
    pub fn run_setup(
        &self,
        runner: &CommandRunner,
        commands: &[String],
        timeout: Duration,
        cancel_check: &dyn Fn() -> bool,
    ) -> Result<SetupStatus> {
        for command in commands {
            if cancel_check() {
                info!("cancellation observed between setup commands");
                return Ok(SetupStatus::Canceled);
            }
            info!(command = %command, "running setup command");
            let request = CommandRequest {
                invocation: Invocation::Shell(command.clone()),
                cwd: self.paths.dir.clone(),
                env: Vec::new(),
                timeout: Some(timeout),
                output_limit_bytes: crate::io::process::DEFAULT_OUTPUT_LIMIT_BYTES,
            };
            let output = runner.run(&request)?;
            if output.timed_out {
                return Err(anyhow!(
                    "setup command '{command}' timed out after {}s",
                    timeout.as_secs()
                ));
            }
            if !output.success() {
                return Err(anyhow!(
                    "setup command '{command}' failed with exit code {:?}: {}",
                    output.exit_code,
                    crate::core::text::snippet(
                        &output.combined(),
                        crate::core::text::DIAGNOSTIC_SNIPPET_CHARS
                    )
                ));
            }
        }
        Ok(SetupStatus::Completed)
    }

    /// Commit any in-flight work the agent left behind.
    ///
    /// An agent subprocess can be killed mid-edit (timeout, crash,
    /// force-cancel); without this commit that work would vanish when the
    /// sandbox is later deleted. Returns true when a commit was created.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn auto_save_uncommitted(&self) -> Result<bool> {
        let git = self.sandbox_git();
        if git.is_clean()? {
            return Ok(false);
        }
        info!("auto-saving uncommitted sandbox changes");
        git.add_all()?;
        let message = format!("[AUTO-SAVE] orchestrator run {}", self.run_id);
        git.commit_staged(&message)
    }

    /// Commits on the sandbox branch ahead of the main branch.
    pub fn commit_count(&self) -> Result<u64> {
        let git = self.sandbox_git();
        let base = self
            .repo_git()
            .default_base_branch()?
            .ok_or_else(|| anyhow!("no main/master branch to count commits against"))?;
        git.commits_ahead_of(&base)
    }

    /// Whether deleting the worktree cannot lose work.
    ///
    /// False on a dirty tree, on unverifiable remote state, or on unpushed
    /// commits to an already-pushed branch. True only when the tree is clean
    /// and the branch either was never pushed or is fully pushed.
    #[instrument(skip_all, fields(branch = %self.branch))]
    pub fn ensure_worktree_safe_to_delete(&self) -> Result<bool> {
        let git = self.sandbox_git();
        if !git.is_clean()? {
            debug!("sandbox has uncommitted changes, refusing deletion");
            return Ok(false);
        }
        if self.repo_git().remote_url(REMOTE)?.is_none() {
            return Ok(true);
        }
        match git.remote_branch_exists(REMOTE, &self.branch) {
            Ok(false) => return Ok(true),
            Ok(true) => {}
            Err(err) => {
                warn!(%err, "cannot query remote, refusing deletion");
                return Ok(false);
            }
        }
        if let Err(err) = git.fetch_branch(REMOTE, &self.branch) {
            warn!(%err, "cannot fetch remote branch, refusing deletion");
            return Ok(false);
        }
        let unpushed = git.commits_ahead_of(&format!("{REMOTE}/{}", self.branch))?;
        Ok(unpushed == 0)
    }

    pub fn push_branch(&self) -> Result<()> {
        self.sandbox_git().push_branch(REMOTE, &self.branch)
    }

    /// Best-effort pull-request creation via the `gh` CLI.
    ///
    /// Degrades to None (with a logged reason) when `gh` is missing,
    /// unauthenticated, or creation fails. An already-existing PR counts as
    /// success; its URL is fetched and returned.
    #[instrument(skip_all, fields(branch = %self.branch))]
    pub fn create_pull_request(&self, runner: &CommandRunner, title: &str) -> Option<String> {
        if !self.gh_ready(runner) {
            return None;
        }

        let create = self.run_gh(
            runner,
            vec![
                "gh".to_string(),
                "pr".to_string(),
                "create".to_string(),
                "--head".to_string(),
                self.branch.clone(),
                "--title".to_string(),
                title.to_string(),
                "--body".to_string(),
                format!("Automated sprint run `{}`.", self.run_id),
            ],
        )?;

        if create.success() {
            return extract_pr_url(&create.combined());
        }
        if create.combined().contains("already exists") {
            debug!("pull request already exists, fetching its URL");
            let view = self.run_gh(
                runner,
                vec![
                    "gh".to_string(),
                    "pr".to_string(),
                    "view".to_string(),
                    self.branch.clone(),
                    "--json".to_string(),
                    "url".to_string(),
                    "--jq".to_string(),
                    ".url".to_string(),
                ],
            )?;
            if view.success() {
                let url = view.stdout.trim().to_string();
                if !url.is_empty() {
                    return Some(url);
                }
            }
        }
        warn!(exit_code = ?create.exit_code, "pull request creation failed");
        None
    }

    fn gh_ready(&self, runner: &CommandRunner) -> bool {
        let version = self.run_gh(
            runner,
            vec!["gh".to_string(), "--version".to_string()],
        );
        match version {
            Some(output) if output.success() => {}
            _ => {
                warn!("gh CLI not available, skipping pull request");
                return false;
            }
        }
        let auth = self.run_gh(
            runner,
            vec!["gh".to_string(), "auth".to_string(), "status".to_string()],
        );
        match auth {
            Some(output) if output.success() => true,
            _ => {
                warn!("gh CLI not authenticated, skipping pull request");
                false
            }
        }
    }

    fn run_gh(
        &self,
        runner: &CommandRunner,
        argv: Vec<String>,
    ) -> Option<crate::io::process::CommandOutput> {
        let request = CommandRequest {
            invocation: Invocation::Argv(argv),
            cwd: self.paths.dir.clone(),
            env: Vec::new(),
            timeout: Some(Duration::from_secs(60)),
            output_limit_bytes: crate::io::process::DEFAULT_OUTPUT_LIMIT_BYTES,
        };
        match runner.run(&request) {
            Ok(output) => Some(output),
            Err(err) => {
                warn!(%err, "gh invocation failed to spawn");
                None
            }
        }
    }

    /// The terminal decision tree for the sandbox and its branch.
    ///
    /// Never returns an error: every step is best-effort and every failure
    /// downgrades to preserving the worktree with a note.
    #[instrument(skip_all, fields(run_id = %self.run_id, sync_success))]
    pub fn finalize(&self, runner: &CommandRunner, sync_success: bool) -> FinalizeOutcome {
        let mut outcome = FinalizeOutcome::default();

        if let Err(err) = self.auto_save_uncommitted() {
            warn!(%err, "auto-save failed");
            outcome.notes.push(format!("auto-save failed: {err:#}"));
        }

        let commits = match self.commit_count() {
            Ok(count) => count,
            Err(err) => {
                // Unverified work: do not risk deleting it.
                warn!(%err, "could not determine commit count, preserving sandbox");
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "commit count indeterminate ({err:#}); sandbox preserved at {}",
                    self.paths.dir.display()
                ));
                return outcome;
            }
        };

        if commits == 0 {
            info!("no commits on sandbox branch, cleaning up");
            self.cleanup_worktree(&mut outcome);
            if outcome.cleaned_up
                && let Err(err) = self.repo_git().delete_branch(&self.branch)
            {
                warn!(%err, "failed to delete empty branch");
                outcome.notes.push(format!("branch deletion failed: {err:#}"));
            }
            return outcome;
        }

        let hosted = match self.repo_git().remote_url(REMOTE) {
            Ok(url) => url.is_some_and(|url| is_hosted_url(&url)),
            Err(err) => {
                warn!(%err, "could not inspect remote");
                false
            }
        };

        if !hosted {
            // The worktree shares object storage with the original repo, so
            // commits are already safe on the branch. Nothing to push.
            if !sync_success {
                info!("task sync failed, preserving sandbox for manual recovery");
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "task sync failed; sandbox preserved at {} on branch {}",
                    self.paths.dir.display(),
                    self.branch
                ));
                return outcome;
            }
            self.cleanup_worktree_if_safe(&mut outcome);
            return outcome;
        }

        match self.push_branch() {
            Ok(()) => {
                info!("pushed sandbox branch");
                outcome.pr_url = self.create_pull_request(
                    runner,
                    &format!("Sprint run {}", self.run_id),
                );
                self.cleanup_worktree_if_safe(&mut outcome);
            }
            Err(err) => {
                warn!(%err, "push failed, preserving sandbox");
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "push failed ({err:#}); push manually with: git push -u {REMOTE} {}",
                    self.branch
                ));
            }
        }
        outcome
    }

    fn cleanup_worktree_if_safe(&self, outcome: &mut FinalizeOutcome) {
        match self.ensure_worktree_safe_to_delete() {
            Ok(true) => self.cleanup_worktree(outcome),
            Ok(false) => {
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "sandbox not safe to delete; preserved at {}",
                    self.paths.dir.display()
                ));
            }
            Err(err) => {
                warn!(%err, "safe-to-delete check failed");
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "safe-to-delete check failed ({err:#}); sandbox preserved at {}",
                    self.paths.dir.display()
                ));
            }
        }
    }

    fn cleanup_worktree(&self, outcome: &mut FinalizeOutcome) {
        match self.repo_git().worktree_remove_force(&self.paths.dir) {
            Ok(()) => outcome.cleaned_up = true,
            Err(err) => {
                warn!(%err, "worktree removal failed");
                outcome.worktree_preserved = true;
                outcome.notes.push(format!(
                    "worktree removal failed ({err:#}); remove manually with: git worktree remove --force {}",
                    self.paths.dir.display()
                ));
            }
        }
    }

    /// Read the sandbox task snapshot back for reconciliation.
    pub fn read_sandbox_tasks(&self) -> Result<Vec<Task>> {
        let path = &self.paths.tasks_path;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read sandbox tasks {}", path.display()))?;
        let board: TaskBoard = serde_json::from_str(&contents)
            .with_context(|| format!("parse sandbox tasks {}", path.display()))?;
        Ok(board.tasks)
    }

    /// Append an iteration block to the sandbox progress log.
    pub fn log_progress(&self, title: &str, body: &str) -> Result<()> {
        append_block(&self.paths.progress_log_path, title, body)
    }
}

fn is_hosted_url(url: &str) -> bool {
    url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("ssh://")
        || url.starts_with("git@")
}

fn extract_pr_url(output: &str) -> Option<String> {
    // gh prints the PR URL on success, sometimes amid other chatter.
    let re = Regex::new(r"https://\S+/pull/\d+").expect("pr url pattern is valid");
    re.find(output).map(|m| m.as_str().to_string())
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_urls_are_detected() {
        assert!(is_hosted_url("https://github.com/acme/app.git"));
        assert!(is_hosted_url("git@github.com:acme/app.git"));
        assert!(is_hosted_url("ssh://git@host/app.git"));
        assert!(!is_hosted_url("/srv/git/app.git"));
        assert!(!is_hosted_url("../origin-repo"));
    }

    #[test]
    fn pr_url_is_extracted_from_noisy_output() {
        let output = "Creating pull request for run-1 into main\nhttps://github.com/acme/app/pull/42\n";
        assert_eq!(
            extract_pr_url(output),
            Some("https://github.com/acme/app/pull/42".to_string())
        );
        assert_eq!(extract_pr_url("no url here"), None);
    }
}
