//! Git adapter for sandbox lifecycle commands.
//!
//! The orchestrator's safety decisions (auto-save, worktree deletion, push)
//! all hinge on precise git state, so we keep a small, explicit wrapper
//! around `git` subprocess calls instead of going through the general
//! command runner.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::text::{DIAGNOSTIC_SNIPPET_CHARS, snippet};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True when `git status --porcelain` reports nothing at all.
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// The base branch sandbox commits are counted against.
    pub fn default_base_branch(&self) -> Result<Option<String>> {
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(None)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Attach a worktree at `path` to an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path_str(path)?;
        self.run_checked(&["worktree", "add", path_str, branch])?;
        Ok(())
    }

    /// Create a branch at HEAD and check it out into a worktree at `path`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add_new(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path_str(path)?;
        self.run_checked(&["worktree", "add", "-b", branch, path_str])?;
        Ok(())
    }

    /// Force-remove a worktree registration and its directory.
    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        let path_str = path_str(path)?;
        self.run_checked(&["worktree", "remove", "--force", path_str])?;
        Ok(())
    }

    /// Drop stale worktree registrations whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Delete a local branch even if unmerged.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Commits on `HEAD` that `base` does not have.
    pub fn commits_ahead_of(&self, base: &str) -> Result<u64> {
        let out = self.run_capture(&["rev-list", "--count", &format!("{base}..HEAD")])?;
        out.trim()
            .parse::<u64>()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// URL of the named remote, or None when it is not configured.
    pub fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        let out = self.run(&["remote", "get-url", remote])?;
        if !out.status.success() {
            return Ok(None);
        }
        let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
        Ok(if url.is_empty() { None } else { Some(url) })
    }

    /// Whether the branch exists on the named remote (network call).
    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "ls-remote",
                "--exit-code",
                "--heads",
                remote,
                branch,
            ])?
            .status;
        Ok(status.success())
    }

    pub fn fetch_branch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, branch])?;
        Ok(())
    }

    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    /// Tell git to ignore local modifications to a tracked file.
    ///
    /// Returns Ok(false) when the path is not tracked (skip-worktree only
    /// applies to index entries); the caller treats that as a soft miss.
    pub fn skip_worktree(&self, rel_path: &str) -> Result<bool> {
        let out = self.run(&["update-index", "--skip-worktree", rel_path])?;
        if out.status.success() {
            return Ok(true);
        }
        warn!(path = rel_path, "skip-worktree not applied (untracked path)");
        Ok(false)
    }

    /// Absolute path of the repository's shared `info/exclude` file. From a
    /// worktree this resolves into the common git dir, so the exclusion
    /// applies to every worktree of the repo.
    pub fn exclude_file(&self) -> Result<PathBuf> {
        let out = self.run_capture(&[
            "rev-parse",
            "--path-format=absolute",
            "--git-path",
            "info/exclude",
        ])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Add `pattern` to `info/exclude` so untracked orchestration artifacts
    /// never show up in status or get swept into commits. Idempotent.
    pub fn add_to_exclude(&self, pattern: &str) -> Result<()> {
        let path = self.exclude_file()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(pattern);
        contents.push('\n');
        std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        debug!(pattern, "added exclude pattern");
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let mut detail = stderr.trim().to_string();
            if detail.is_empty() {
                detail = stdout.trim().to_string();
            }
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                snippet(&detail, DIAGNOSTIC_SNIPPET_CHARS)
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }
}
