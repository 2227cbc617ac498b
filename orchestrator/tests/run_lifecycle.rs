//! End-to-end run loop tests with a scripted agent against real git
//! repositories. Each test drives a queued record to a terminal state and
//! inspects the record, the root board, and the sandbox aftermath.

use std::path::Path;
use std::process::Command;

use anyhow::Result;

use orchestrator::core::branch::run_branch_for;
use orchestrator::core::sentinel::COMPLETION_SENTINEL;
use orchestrator::core::types::{ExecutorMode, RunReason, RunStatus, TaskBoard, TaskStatus};
use orchestrator::io::git::Git;
use orchestrator::io::paths::SANDBOX_TASKS_REL;
use orchestrator::io::run_record::{NewRunParams, RunRecord, RunRecordStore};
use orchestrator::io::task_store::{AutomationSettings, FsTaskStore, TaskStore};
use orchestrator::run::execute_run;
use orchestrator::test_support::{
    ScriptedAgent, ScriptedStep, TestRepo, board, commit_all, task,
};

const SPRINT: &str = "sprint-1";

fn seeded_repo(tasks: Vec<orchestrator::core::types::Task>) -> Result<TestRepo> {
    let repo = TestRepo::new()?;
    repo.seed_board(SPRINT, &board("Sprint One", tasks))?;
    repo.seed_settings(&AutomationSettings::default())?;
    Ok(repo)
}

fn queued_record(repo: &TestRepo, run_id: &str, selected: &[&str], max_iterations: u32) -> Result<RunRecord> {
    let paths = repo.paths();
    let record = RunRecord::queued(NewRunParams {
        run_id: run_id.to_string(),
        project_id: "proj".to_string(),
        sprint_id: SPRINT.to_string(),
        sprint_name: "Sprint One".to_string(),
        max_iterations,
        executor_mode: ExecutorMode::Local,
        selected_task_ids: selected.iter().map(|id| id.to_string()).collect(),
        sandbox_path: paths.sandbox_dir(run_id),
        sandbox_branch: run_branch_for(run_id),
    });
    RunRecordStore::new(&repo.root).create(&record)?;
    Ok(record)
}

/// Flip `passes` on a task in the sandbox snapshot, as the agent is
/// instructed to do after verifying its work.
fn mark_task_passed(workdir: &Path, task_id: &str) -> Result<()> {
    let path = workdir.join(SANDBOX_TASKS_REL);
    let mut snapshot: TaskBoard = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    for task in &mut snapshot.tasks {
        if task.id == task_id {
            task.passes = true;
            task.last_run = Some("2026-08-29T10:00:00+00:00".to_string());
        }
    }
    let mut payload = serde_json::to_string_pretty(&snapshot)?;
    payload.push('\n');
    std::fs::write(&path, payload)?;
    Ok(())
}

fn branch_subjects(root: &Path, branch: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["log", branch, "--format=%s"])
        .current_dir(root)
        .output()?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[test]
fn sentinel_completes_run_and_promotes_task_to_review() -> Result<()> {
    let repo = seeded_repo(vec![task("t1", TaskStatus::Todo)])?;
    queued_record(&repo, "run-a", &["t1"], 5)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(vec![
        ScriptedStep::ok("implemented t1").with_action(|workdir| {
            std::fs::write(workdir.join("feature.txt"), "done\n")?;
            mark_task_passed(workdir, "t1")
        }),
        ScriptedStep::ok(&format!("nothing pending, {COMPLETION_SENTINEL}")),
    ]);

    let outcome = execute_run(&repo.root, "run-a", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.reason, RunReason::Completed);
    assert_eq!(agent.remaining(), 0);

    let record = RunRecordStore::new(&repo.root).load("run-a")?;
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.current_iteration, 2);
    assert!(record.finished_at.is_some());
    assert_eq!(record.pid, None);

    let synced = store.read_task_set(SPRINT)?;
    let t1 = synced.tasks.iter().find(|t| t.id == "t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Review);
    assert!(t1.passes);

    // Work was auto-saved onto the branch; the clean worktree was deleted.
    assert!(!record.sandbox_path.exists());
    assert!(Git::new(&repo.root).branch_exists(&record.sandbox_branch)?);
    let subjects = branch_subjects(&repo.root, &record.sandbox_branch)?;
    assert!(subjects.contains("[AUTO-SAVE] orchestrator run run-a"));

    assert!(repo.paths().journal_path.exists());
    Ok(())
}

#[test]
fn agent_failure_terminates_run_and_preserves_work_on_branch() -> Result<()> {
    let repo = seeded_repo(vec![task("t1", TaskStatus::Todo)])?;
    queued_record(&repo, "run-b", &["t1"], 5)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(vec![ScriptedStep::failing(1, "tool crashed").with_action(
        |workdir| {
            std::fs::write(workdir.join("half-done.txt"), "partial\n")?;
            Ok(())
        },
    )]);

    let outcome = execute_run(&repo.root, "run-b", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.reason, RunReason::Error);

    let record = RunRecordStore::new(&repo.root).load("run-b")?;
    assert_eq!(record.current_iteration, 1);
    assert!(!record.errors.is_empty());
    assert!(record.errors[0].contains("tool crashed"));

    // The half-finished edit survives as an auto-save commit.
    let subjects = branch_subjects(&repo.root, &record.sandbox_branch)?;
    assert!(subjects.contains("[AUTO-SAVE] orchestrator run run-b"));

    // Sync still ran: the task fell back to in_progress, not review.
    let synced = store.read_task_set(SPRINT)?;
    assert_eq!(synced.tasks[0].status, TaskStatus::InProgress);
    Ok(())
}

#[test]
fn setup_failure_fails_the_run_and_is_recorded_as_an_error() -> Result<()> {
    let repo = TestRepo::new()?;
    repo.seed_board(SPRINT, &board("Sprint One", vec![task("t1", TaskStatus::Todo)]))?;
    repo.seed_settings(&AutomationSettings {
        setup_commands: vec!["exit 3".to_string()],
        ..AutomationSettings::default()
    })?;
    queued_record(&repo, "run-g", &["t1"], 5)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(Vec::new());

    let outcome = execute_run(&repo.root, "run-g", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.reason, RunReason::Error);
    let record = RunRecordStore::new(&repo.root).load("run-g")?;
    assert_eq!(record.current_iteration, 0);
    assert!(!record.errors.is_empty());
    assert!(record.errors.iter().any(|e| e.contains("exit 3")));
    Ok(())
}

#[test]
fn no_pending_tasks_completes_without_invoking_agent() -> Result<()> {
    let mut done = task("t1", TaskStatus::Done);
    done.passes = true;
    let repo = seeded_repo(vec![done])?;
    queued_record(&repo, "run-c", &[], 5)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(Vec::new());

    let outcome = execute_run(&repo.root, "run-c", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Completed);
    let record = RunRecordStore::new(&repo.root).load("run-c")?;
    assert_eq!(record.current_iteration, 0);

    // An empty branch is deleted along with its worktree.
    assert!(!record.sandbox_path.exists());
    assert!(!Git::new(&repo.root).branch_exists(&record.sandbox_branch)?);
    Ok(())
}

#[test]
fn exhausted_budget_stops_the_run() -> Result<()> {
    let repo = seeded_repo(vec![task("t1", TaskStatus::Todo)])?;
    queued_record(&repo, "run-d", &["t1"], 2)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(vec![
        ScriptedStep::ok("still going"),
        ScriptedStep::ok("still going"),
    ]);

    let outcome = execute_run(&repo.root, "run-d", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.reason, RunReason::MaxIterations);
    let record = RunRecordStore::new(&repo.root).load("run-d")?;
    assert_eq!(record.current_iteration, 2);
    assert_eq!(agent.remaining(), 0);
    Ok(())
}

#[test]
fn sync_failure_preserves_the_sandbox() -> Result<()> {
    let repo = seeded_repo(vec![task("t1", TaskStatus::Todo)])?;
    queued_record(&repo, "run-e", &["t1"], 5)?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(vec![
        ScriptedStep::ok(&format!("done, {COMPLETION_SENTINEL}")).with_action(|workdir| {
            std::fs::write(workdir.join("feature.txt"), "done\n")?;
            commit_all(workdir, "feat: implement t1")?;
            // Destroy the snapshot so the sync back home cannot run.
            std::fs::remove_file(workdir.join(SANDBOX_TASKS_REL))?;
            Ok(())
        }),
    ]);

    let outcome = execute_run(&repo.root, "run-e", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Completed);
    let record = RunRecordStore::new(&repo.root).load("run-e")?;
    assert!(record.errors.iter().any(|e| e.contains("task sync failed")));
    // Committed work plus a failed sync means the sandbox must survive for
    // manual recovery.
    assert!(record.sandbox_path.exists());
    Ok(())
}

#[test]
fn pre_requested_cancellation_ends_before_checkout() -> Result<()> {
    let repo = seeded_repo(vec![task("t1", TaskStatus::Todo)])?;
    queued_record(&repo, "run-f", &["t1"], 5)?;
    let records = RunRecordStore::new(&repo.root);
    records.update("run-f", |r| {
        r.cancellation_requested_at = Some("2026-08-29T09:00:00+00:00".to_string());
    })?;
    let store = FsTaskStore::new(&repo.root);
    let agent = ScriptedAgent::new(Vec::new());

    let outcome = execute_run(&repo.root, "run-f", &store, &agent)?;

    assert_eq!(outcome.status, RunStatus::Canceled);
    assert_eq!(outcome.reason, RunReason::Canceled);
    let record = records.load("run-f")?;
    assert!(!record.sandbox_path.exists());
    assert_eq!(record.current_iteration, 0);
    Ok(())
}
