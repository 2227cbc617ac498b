//! The run loop: drives one sprint run from queued record to terminal state.
//!
//! `execute_run` is the process entrypoint for a spawned run. Its contract:
//! it returns `Err` only when the run record itself cannot be loaded or
//! updated; every other failure is folded into the record as a terminal
//! `failed` state so the dashboard always sees an outcome.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::reconcile::{pass_fail_counts, reconcile_tasks};
use crate::core::sentinel::contains_completion_sentinel;
use crate::core::settings::{AgentOverrides, resolve_agent};
use crate::core::text::{DIAGNOSTIC_SNIPPET_CHARS, snippet};
use crate::core::types::{RunReason, RunStatus, Task};
use crate::io::agent::{AgentInvoker, AgentRequest, CliAgentInvoker};
use crate::io::paths::OrchestratorPaths;
use crate::io::process::{CommandRunner, DEFAULT_OUTPUT_LIMIT_BYTES};
use crate::io::progress_log::{RunSummary, append_run_summary, copy_progress_log};
use crate::io::prompt::{IterationPrompt, render_iteration_prompt};
use crate::io::run_record::{RecordingCommandObserver, RunRecordStore, now_rfc3339};
use crate::io::sandbox::{SetupStatus, WorkspaceManager};
use crate::io::task_store::{FsTaskStore, TaskStore};

/// Terminal result of a run, mirrored into the record.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub reason: RunReason,
    pub message: String,
    pub pr_url: Option<String>,
}

/// How the iteration loop ended.
enum LoopEnd {
    /// Agent emitted the completion sentinel, or there was no pending work.
    Completed { message: String },
    MaxIterations,
    Canceled,
    Errored { message: String },
}

/// Execute the run identified by `run_id` in the project at `root`, using the
/// project's own task store and a CLI-backed agent.
pub fn execute_run_local(root: &Path, run_id: &str) -> Result<RunOutcome> {
    let store = FsTaskStore::new(root);
    let settings = store.read_automation_settings()?;
    let records = RunRecordStore::new(root);
    let record = records.load(run_id)?;
    let agent = resolve_agent(&overrides_from_env(), &settings.agent)
        .map_err(|msg| anyhow!(msg))?;
    let invoker = CliAgentInvoker::new(
        agent,
        record.executor_mode,
        settings.docker_image.clone(),
        CommandRunner::new(Box::new(RecordingCommandObserver::new(records, run_id))),
    )?;
    execute_run(root, run_id, &store, &invoker)
}

/// Agent overrides from the process environment. Blank values count as
/// unset, same as the settings cascade.
pub fn overrides_from_env() -> AgentOverrides {
    fn var(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
    AgentOverrides {
        name: var("ORCHESTRATOR_AGENT"),
        bin: var("ORCHESTRATOR_AGENT_BIN"),
        model: var("ORCHESTRATOR_AGENT_MODEL"),
        permission_mode: var("ORCHESTRATOR_AGENT_PERMISSION_MODE"),
    }
}

/// Drive `run_id` to a terminal state with injected task store and agent.
#[instrument(skip_all, fields(run_id))]
pub fn execute_run(
    root: &Path,
    run_id: &str,
    store: &dyn TaskStore,
    agent: &dyn AgentInvoker,
) -> Result<RunOutcome> {
    let paths = OrchestratorPaths::new(root);
    let records = RunRecordStore::new(root);
    let record = records.load(run_id)?;
    if record.is_terminal() {
        return Err(anyhow!(
            "run {run_id} is already terminal ({})",
            record.status.as_str()
        ));
    }

    records.update(run_id, |r| {
        r.status = RunStatus::Running;
        r.started_at = Some(now_rfc3339());
        r.pid = Some(std::process::id());
    })?;

    let workspace = WorkspaceManager::new(
        root,
        record.sandbox_path.clone(),
        record.sandbox_branch.clone(),
        run_id,
    );
    let runner = CommandRunner::new(Box::new(RecordingCommandObserver::new(
        records.clone(),
        run_id,
    )));

    let mut checked_out = false;
    let end = match drive(
        &records,
        run_id,
        &record.sprint_id,
        &record.sprint_name,
        record.max_iterations,
        store,
        agent,
        &workspace,
        &runner,
        &mut checked_out,
    ) {
        Ok(end) => end,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "run loop failed");
            LoopEnd::Errored {
                message: format!("{err:#}"),
            }
        }
    };

    let (status, reason, message) = match &end {
        LoopEnd::Completed { message } => {
            (RunStatus::Completed, RunReason::Completed, message.clone())
        }
        LoopEnd::MaxIterations => (
            RunStatus::Stopped,
            RunReason::MaxIterations,
            format!("iteration budget of {} exhausted", record.max_iterations),
        ),
        LoopEnd::Canceled => (
            RunStatus::Canceled,
            RunReason::Canceled,
            "canceled on request".to_string(),
        ),
        LoopEnd::Errored { message } => (RunStatus::Failed, RunReason::Error, message.clone()),
    };

    // Even a failed or canceled run syncs whatever the agent managed to do,
    // preserves its log, and settles its sandbox.
    let (sync_success, sandbox_tasks) = if checked_out {
        sync_back(store, &record.sprint_id, &record.selected_task_ids, &workspace)
    } else {
        (true, Vec::new())
    };

    let mut pr_url = None;
    let mut notes = Vec::new();
    if checked_out {
        let log_path = paths.run_log_path(run_id);
        match copy_progress_log(&workspace.sandbox_paths().progress_log_path, &log_path) {
            Ok(true) => debug!(path = %log_path.display(), "copied progress log"),
            Ok(false) => debug!("no progress log to copy"),
            Err(err) => warn!(%err, "failed to copy progress log"),
        }

        let outcome = workspace.finalize(&runner, sync_success);
        pr_url = outcome.pr_url;
        notes = outcome.notes;
        if outcome.worktree_preserved {
            info!(path = %workspace.sandbox_paths().dir.display(), "sandbox preserved");
        }
    }

    let (passed, failed) = pass_fail_counts(&record.selected_task_ids, &sandbox_tasks);
    let summary = RunSummary {
        run_id: run_id.to_string(),
        status: status.as_str(),
        reason: reason.as_str(),
        agent: agent.describe(),
        passed,
        failed,
        log_path: paths.run_log_path(run_id).display().to_string(),
    };
    if let Err(err) = append_run_summary(&paths.journal_path, &summary) {
        warn!(%err, "failed to append run summary to journal");
    }

    let pr_url_clone = pr_url.clone();
    let message_clone = message.clone();
    records.update(run_id, move |r| {
        // Every failure (setup, checkout, agent exit) lands in `errors`, not
        // just in the last message.
        if status == RunStatus::Failed {
            r.errors.push(message_clone.clone());
        }
        r.finish(status, reason, message_clone);
        r.pr_url = pr_url_clone;
        if !sync_success {
            r.errors.push("task sync failed; sandbox preserved".to_string());
        }
        for note in notes {
            r.errors.push(note);
        }
        r.pid = None;
    })?;

    info!(
        status = status.as_str(),
        reason = reason.as_str(),
        passed,
        failed,
        "run finished"
    );
    Ok(RunOutcome {
        status,
        reason,
        message,
        pr_url,
    })
}

/// The happy path: checkout, plan, setup, iterate. Any `Err` from here is a
/// run failure, not a process failure.
#[allow(clippy::too_many_arguments)]
fn drive(
    records: &RunRecordStore,
    run_id: &str,
    sprint_id: &str,
    sprint_name: &str,
    max_iterations: u32,
    store: &dyn TaskStore,
    agent: &dyn AgentInvoker,
    workspace: &WorkspaceManager,
    runner: &CommandRunner,
    checked_out: &mut bool,
) -> Result<LoopEnd> {
    let cancel_check = || match records.load(run_id) {
        Ok(record) => record.cancel_requested(),
        Err(err) => {
            warn!(%err, "failed to poll run record for cancellation");
            false
        }
    };

    if cancel_check() {
        return Ok(LoopEnd::Canceled);
    }

    workspace
        .checkout_workspace()
        .context("checkout sandbox worktree")?;
    *checked_out = true;

    let plan = workspace
        .prepare_sandbox_plan(store, sprint_id)
        .context("prepare sandbox plan")?;
    if plan.pending.is_empty() {
        info!("no pending tasks, completing without iterations");
        return Ok(LoopEnd::Completed {
            message: "no pending tasks".to_string(),
        });
    }
    info!(pending = plan.pending.len(), "sandbox prepared");

    let settings = store.read_automation_settings()?;
    let setup_timeout = Duration::from_secs(settings.setup_timeout_secs());
    match workspace.run_setup(runner, &settings.setup_commands, setup_timeout, &cancel_check)? {
        SetupStatus::Completed => {}
        SetupStatus::Canceled => return Ok(LoopEnd::Canceled),
    }

    for iteration in 1..=max_iterations {
        if cancel_check() {
            info!(iteration, "cancellation observed at iteration boundary");
            return Ok(LoopEnd::Canceled);
        }
        records.update(run_id, |r| {
            r.current_iteration = iteration;
            r.last_message = Some(format!("iteration {iteration} of {max_iterations}"));
            r.last_progress_at = Some(now_rfc3339());
        })?;
        info!(iteration, max_iterations, "starting iteration");

        let prompt = render_iteration_prompt(&IterationPrompt {
            sprint_name,
            iteration,
            max_iterations,
        })?;
        let result = agent
            .invoke(&AgentRequest {
                workdir: workspace.sandbox_paths().dir.clone(),
                prompt,
                output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            })
            .with_context(|| format!("invoke agent on iteration {iteration}"))?;

        let excerpt = snippet(&result.output, DIAGNOSTIC_SNIPPET_CHARS);
        if let Err(err) =
            workspace.log_progress(&format!("iteration {iteration} agent output"), &excerpt)
        {
            warn!(%err, "failed to log iteration output");
        }

        if !result.success() {
            let message = format!(
                "agent exited with code {:?} on iteration {iteration}: {excerpt}",
                result.exit_code
            );
            return Ok(LoopEnd::Errored { message });
        }
        if contains_completion_sentinel(&result.output) {
            info!(iteration, "agent signaled completion");
            return Ok(LoopEnd::Completed {
                message: format!("agent signaled completion on iteration {iteration}"),
            });
        }
    }
    Ok(LoopEnd::MaxIterations)
}

/// Merge sandbox task results back into the root board. Returns whether the
/// sync succeeded plus the sandbox snapshot for summary counting.
fn sync_back(
    store: &dyn TaskStore,
    sprint_id: &str,
    selected_ids: &[String],
    workspace: &WorkspaceManager,
) -> (bool, Vec<Task>) {
    let sandbox_tasks = match workspace.read_sandbox_tasks() {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not read sandbox tasks");
            return (false, Vec::new());
        }
    };
    let mut board = match store.read_task_set(sprint_id) {
        Ok(board) => board,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not read root board");
            return (false, sandbox_tasks);
        }
    };
    reconcile_tasks(selected_ids, &sandbox_tasks, &mut board.tasks);
    match store.write_task_set(sprint_id, &board) {
        Ok(()) => (true, sandbox_tasks),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not write root board");
            (false, sandbox_tasks)
        }
    }
}
