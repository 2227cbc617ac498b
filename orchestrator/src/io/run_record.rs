//! Durable run records polled by the web dashboard.
//!
//! One JSON file per run under `.orchestrator/runs/`, written atomically
//! (temp file + rename). The orchestrator process is the only writer during
//! a run's active lifetime; the dashboard only ever reads. Individual writes
//! are last-write-wins, which is all the polling contract requires.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{ExecutorMode, RunReason, RunStatus};
use crate::io::process::CommandObserver;

/// Current UTC time in the format every record timestamp uses.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// The externally visible state of one orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project_id: String,
    pub sprint_id: String,
    pub sprint_name: String,
    pub status: RunStatus,
    /// Set only in terminal states.
    #[serde(default)]
    pub reason: Option<RunReason>,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub max_iterations: u32,
    pub current_iteration: u32,
    #[serde(default)]
    pub executor_mode: ExecutorMode,
    /// Fixed at creation; retries reuse the same run identity but never
    /// change the task set.
    pub selected_task_ids: Vec<String>,
    pub sandbox_path: PathBuf,
    pub sandbox_branch: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_command: Option<String>,
    #[serde(default)]
    pub last_command_exit_code: Option<i32>,
    /// Append-only human-readable failure strings.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub last_progress_at: Option<String>,
    /// OS process id of the spawned orchestrator, for force-kill escalation.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub cancellation_requested_at: Option<String>,
}

/// Fields the trigger path supplies when creating a record.
#[derive(Debug, Clone)]
pub struct NewRunParams {
    pub run_id: String,
    pub project_id: String,
    pub sprint_id: String,
    pub sprint_name: String,
    pub max_iterations: u32,
    pub executor_mode: ExecutorMode,
    pub selected_task_ids: Vec<String>,
    pub sandbox_path: PathBuf,
    pub sandbox_branch: String,
}

impl RunRecord {
    pub fn queued(params: NewRunParams) -> Self {
        Self {
            run_id: params.run_id,
            project_id: params.project_id,
            sprint_id: params.sprint_id,
            sprint_name: params.sprint_name,
            status: RunStatus::Queued,
            reason: None,
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
            max_iterations: params.max_iterations,
            current_iteration: 0,
            executor_mode: params.executor_mode,
            selected_task_ids: params.selected_task_ids,
            sandbox_path: params.sandbox_path,
            sandbox_branch: params.sandbox_branch,
            last_message: None,
            last_command: None,
            last_command_exit_code: None,
            errors: Vec::new(),
            last_progress_at: None,
            pid: None,
            pr_url: None,
            cancellation_requested_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancellation_requested_at.is_some()
    }

    /// Move to a terminal state. `finished_at` is set here and only here.
    pub fn finish(&mut self, status: RunStatus, reason: RunReason, message: impl Into<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.reason = Some(reason);
        self.finished_at = Some(now_rfc3339());
        self.last_message = Some(message.into());
    }

    /// Reset transient fields for a retry. The task set and run identity are
    /// preserved; only terminal runs may be reset.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if !self.is_terminal() {
            return Err(anyhow!(
                "run {} is not terminal (status {})",
                self.run_id,
                self.status.as_str()
            ));
        }
        self.status = RunStatus::Queued;
        self.reason = None;
        self.started_at = None;
        self.finished_at = None;
        self.current_iteration = 0;
        self.last_message = None;
        self.last_command = None;
        self.last_command_exit_code = None;
        self.last_progress_at = None;
        self.pid = None;
        self.pr_url = None;
        self.cancellation_requested_at = None;
        Ok(())
    }
}

/// Filesystem store for run records.
#[derive(Debug, Clone)]
pub struct RunRecordStore {
    runs_dir: PathBuf,
}

impl RunRecordStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = project_root.into();
        Self {
            runs_dir: root.join(".orchestrator").join("runs"),
        }
    }

    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    /// Persist a brand-new record. Fails if the run id already exists.
    pub fn create(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_id);
        if path.exists() {
            return Err(anyhow!("run record already exists at {}", path.display()));
        }
        self.write(record)
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord> {
        let path = self.record_path(run_id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read run record {}", path.display()))?;
        let record: RunRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse run record {}", path.display()))?;
        Ok(record)
    }

    /// Load, mutate, and atomically rewrite a record.
    pub fn update<F>(&self, run_id: &str, mutate: F) -> Result<RunRecord>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut record = self.load(run_id)?;
        mutate(&mut record);
        self.write(&record)?;
        Ok(record)
    }

    pub fn list_by_project(&self, project_id: &str) -> Result<Vec<RunRecord>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.runs_dir)
            .with_context(|| format!("read runs dir {}", self.runs_dir.display()))?;
        for entry in entries {
            let entry = entry.context("read runs dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read run record {}", path.display()))?;
            match serde_json::from_str::<RunRecord>(&contents) {
                Ok(record) if record.project_id == project_id => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), %err, "skipping unparseable run record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn write(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_id);
        debug!(run_id = %record.run_id, status = record.status.as_str(), "writing run record");
        let mut buf = serde_json::to_string_pretty(record)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}

/// Command observer that mirrors subprocess activity into the run record so
/// the dashboard can show live progress without tailing raw output.
pub struct RecordingCommandObserver {
    store: RunRecordStore,
    run_id: String,
}

impl RecordingCommandObserver {
    pub fn new(store: RunRecordStore, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }
}

impl CommandObserver for RecordingCommandObserver {
    fn command_started(&self, command: &str) {
        let command = command.to_string();
        if let Err(err) = self.store.update(&self.run_id, |record| {
            record.last_command = Some(command);
            record.last_command_exit_code = None;
            record.last_progress_at = Some(now_rfc3339());
        }) {
            warn!(%err, "failed to record command start");
        }
    }

    fn command_finished(&self, command: &str, exit_code: Option<i32>) {
        let command = command.to_string();
        if let Err(err) = self.store.update(&self.run_id, |record| {
            record.last_command = Some(command);
            record.last_command_exit_code = exit_code;
            record.last_progress_at = Some(now_rfc3339());
        }) {
            warn!(%err, "failed to record command exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_id: &str, project_id: &str) -> RunRecord {
        RunRecord::queued(NewRunParams {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            sprint_id: "sprint-1".to_string(),
            sprint_name: "Sprint 1".to_string(),
            max_iterations: 5,
            executor_mode: ExecutorMode::Local,
            selected_task_ids: vec!["t1".to_string()],
            sandbox_path: PathBuf::from("/tmp/sandbox"),
            sandbox_branch: "run-x".to_string(),
        })
    }

    #[test]
    fn create_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunRecordStore::new(temp.path());
        let record = sample("run-1", "proj");

        store.create(&record).expect("create");
        let loaded = store.load("run-1").expect("load");
        assert_eq!(loaded, record);
    }

    #[test]
    fn create_refuses_duplicate_run_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunRecordStore::new(temp.path());
        let record = sample("run-1", "proj");

        store.create(&record).expect("create");
        let err = store.create(&record).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn update_persists_mutation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunRecordStore::new(temp.path());
        store.create(&sample("run-1", "proj")).expect("create");

        store
            .update("run-1", |record| {
                record.status = RunStatus::Running;
                record.current_iteration = 2;
            })
            .expect("update");

        let loaded = store.load("run-1").expect("load");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.current_iteration, 2);
    }

    #[test]
    fn finish_sets_finished_at_exactly_once_terminal() {
        let mut record = sample("run-1", "proj");
        assert!(record.finished_at.is_none());

        record.finish(RunStatus::Completed, RunReason::Completed, "done");
        assert!(record.is_terminal());
        assert!(record.finished_at.is_some());
        assert_eq!(record.reason, Some(RunReason::Completed));
    }

    #[test]
    fn retry_resets_transient_fields_but_keeps_task_set() {
        let mut record = sample("run-1", "proj");
        record.finish(RunStatus::Failed, RunReason::Error, "boom");
        record.pid = Some(1234);
        record.current_iteration = 3;

        record.reset_for_retry().expect("reset");
        assert_eq!(record.status, RunStatus::Queued);
        assert_eq!(record.reason, None);
        assert_eq!(record.finished_at, None);
        assert_eq!(record.current_iteration, 0);
        assert_eq!(record.pid, None);
        assert_eq!(record.selected_task_ids, vec!["t1".to_string()]);
    }

    #[test]
    fn retry_rejects_active_runs() {
        let mut record = sample("run-1", "proj");
        record.status = RunStatus::Running;
        assert!(record.reset_for_retry().is_err());
    }

    #[test]
    fn list_by_project_filters_and_sorts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunRecordStore::new(temp.path());
        let mut first = sample("run-1", "proj");
        first.created_at = "2026-08-29T10:00:00+00:00".to_string();
        let mut second = sample("run-2", "proj");
        second.created_at = "2026-08-29T11:00:00+00:00".to_string();
        let other = sample("run-3", "other-proj");

        store.create(&second).expect("create");
        store.create(&first).expect("create");
        store.create(&other).expect("create");

        let records = store.list_by_project("proj").expect("list");
        let ids: Vec<&str> = records.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-1", "run-2"]);
    }

    #[test]
    fn recording_observer_mirrors_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunRecordStore::new(temp.path());
        store.create(&sample("run-1", "proj")).expect("create");

        let observer = RecordingCommandObserver::new(store.clone(), "run-1");
        observer.command_started("npm install");
        let mid = store.load("run-1").expect("load");
        assert_eq!(mid.last_command, Some("npm install".to_string()));
        assert_eq!(mid.last_command_exit_code, None);

        observer.command_finished("npm install", Some(0));
        let done = store.load("run-1").expect("load");
        assert_eq!(done.last_command_exit_code, Some(0));
        assert!(done.last_progress_at.is_some());
    }
}
