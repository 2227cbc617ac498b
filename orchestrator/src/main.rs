//! Sprint-run orchestrator CLI.
//!
//! `start` validates a run request, persists a queued record, and spawns a
//! detached `run` process so the caller (typically the dashboard backend)
//! returns immediately. `run` drives the loop to a terminal state. `cancel`
//! flips the cooperative flag, with an optional force-kill escalation.

use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::Rng;
use rand::distributions::Alphanumeric;

use orchestrator::core::branch::{run_branch_for, validate_branch_name};
use orchestrator::core::settings::resolve_agent;
use orchestrator::core::types::{ExecutorMode, RunReason, RunStatus};
use orchestrator::exit_codes;
use orchestrator::io::paths::OrchestratorPaths;
use orchestrator::io::run_record::{NewRunParams, RunRecord, RunRecordStore, now_rfc3339};
use orchestrator::io::task_store::{AutomationSettings, FsTaskStore, TaskStore};
use orchestrator::run::{execute_run_local, overrides_from_env};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Autonomous sprint-run orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a run request, create its record, and spawn a detached run.
    Start {
        /// Project repository root.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Project identifier recorded on the run.
        #[arg(long)]
        project_id: String,
        /// Sprint (board file) to run.
        #[arg(long)]
        sprint_id: String,
        /// Comma-separated task ids; defaults to every pending task.
        #[arg(long, value_delimiter = ',')]
        tasks: Vec<String>,
        /// Sandbox branch name; defaults to run-<run_id>.
        #[arg(long)]
        branch: Option<String>,
        /// Override the settings' iteration budget.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Executor mode: local, docker, or cloud.
        #[arg(long)]
        executor: Option<String>,
    },
    /// Drive one queued run to a terminal state (normally spawned by start).
    Run {
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Request cooperative cancellation of a run.
    Cancel {
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        #[arg(long)]
        run_id: String,
        /// Also SIGKILL the run process immediately.
        #[arg(long)]
        force: bool,
    },
    /// Re-queue a terminal run with its original task set and spawn it.
    Retry {
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Print a run's record, or all of a project's runs.
    Status {
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        project_id: Option<String>,
    },
}

fn main() {
    orchestrator::logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Start {
            project_root,
            project_id,
            sprint_id,
            tasks,
            branch,
            max_iterations,
            executor,
        } => cmd_start(
            &project_root,
            &project_id,
            &sprint_id,
            tasks,
            branch,
            max_iterations,
            executor.as_deref(),
        ),
        Command::Run {
            project_root,
            run_id,
        } => cmd_run(&project_root, &run_id),
        Command::Cancel {
            project_root,
            run_id,
            force,
        } => cmd_cancel(&project_root, &run_id, force),
        Command::Retry {
            project_root,
            run_id,
        } => cmd_retry(&project_root, &run_id),
        Command::Status {
            project_root,
            run_id,
            project_id,
        } => cmd_status(&project_root, run_id.as_deref(), project_id.as_deref()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_start(
    project_root: &Path,
    project_id: &str,
    sprint_id: &str,
    tasks: Vec<String>,
    branch: Option<String>,
    max_iterations: Option<u32>,
    executor: Option<&str>,
) -> Result<i32> {
    // Everything that can be rejected is rejected before any record exists,
    // so a failed start leaves no trace.
    let store = FsTaskStore::new(project_root);
    let board = store
        .read_task_set(sprint_id)
        .with_context(|| format!("load sprint '{sprint_id}'"))?;
    let pending_ids: Vec<String> = board
        .pending()
        .iter()
        .map(|task| task.id.clone())
        .collect();

    let selected = if tasks.is_empty() {
        pending_ids.clone()
    } else {
        for id in &tasks {
            if !pending_ids.contains(id) {
                bail!("task '{id}' is not a pending task of sprint '{sprint_id}'");
            }
        }
        tasks
    };

    let settings = store.read_automation_settings()?;
    resolve_agent(&overrides_from_env(), &settings.agent).map_err(|msg| anyhow!(msg))?;

    let executor_mode = match executor {
        None => ExecutorMode::Local,
        Some("local") => ExecutorMode::Local,
        Some("docker") => ExecutorMode::Docker,
        Some("cloud") => ExecutorMode::Cloud,
        Some(other) => bail!("unknown executor mode '{other}' (expected local, docker, or cloud)"),
    };
    if executor_mode == ExecutorMode::Cloud {
        bail!("cloud executor mode is not supported by this build");
    }
    if executor_mode == ExecutorMode::Docker
        && settings
            .docker_image
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        bail!("docker executor mode requires docker_image in settings");
    }

    let run_id = new_run_id();
    let sandbox_branch = branch.unwrap_or_else(|| run_branch_for(&run_id));
    validate_branch_name(&sandbox_branch)
        .map_err(|msg| anyhow!("invalid branch name: {msg}"))?;

    let paths = OrchestratorPaths::new(project_root);
    let records = RunRecordStore::new(project_root);
    let record = RunRecord::queued(NewRunParams {
        run_id: run_id.clone(),
        project_id: project_id.to_string(),
        sprint_id: sprint_id.to_string(),
        sprint_name: board.sprint_name.clone(),
        max_iterations: effective_max_iterations(max_iterations, &settings)?,
        executor_mode,
        selected_task_ids: selected,
        sandbox_path: paths.sandbox_dir(&run_id),
        sandbox_branch,
    });
    records.create(&record)?;

    spawn_detached_run(project_root, &run_id)?;
    println!("{run_id}");
    Ok(exit_codes::OK)
}

fn cmd_run(project_root: &Path, run_id: &str) -> Result<i32> {
    let outcome = execute_run_local(project_root, run_id)?;
    println!(
        "{} ({}): {}",
        outcome.status.as_str(),
        outcome.reason.as_str(),
        outcome.message
    );
    if let Some(url) = outcome.pr_url {
        println!("{url}");
    }
    Ok(exit_codes::OK)
}

fn cmd_cancel(project_root: &Path, run_id: &str, force: bool) -> Result<i32> {
    let records = RunRecordStore::new(project_root);
    let record = records.load(run_id)?;
    if record.is_terminal() {
        bail!(
            "run {run_id} is already terminal ({})",
            record.status.as_str()
        );
    }
    // First call asks nicely; a repeated call (or --force) escalates to
    // killing the recorded process.
    let escalate = force || record.cancel_requested();
    let updated = records.update(run_id, |r| {
        if r.cancellation_requested_at.is_none() {
            r.cancellation_requested_at = Some(now_rfc3339());
        }
    })?;
    println!("cancellation requested for {run_id}");

    if escalate {
        match updated.pid {
            Some(pid) => {
                kill_process(pid)?;
                records.update(run_id, |r| {
                    r.finish(RunStatus::Canceled, RunReason::Canceled, "force-killed on request");
                    r.pid = None;
                })?;
                println!("killed process {pid}");
            }
            None => println!("no recorded pid to kill"),
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_retry(project_root: &Path, run_id: &str) -> Result<i32> {
    let records = RunRecordStore::new(project_root);
    let mut record = records.load(run_id)?;
    record.reset_for_retry()?;
    records.update(run_id, move |r| *r = record)?;
    spawn_detached_run(project_root, run_id)?;
    println!("{run_id}");
    Ok(exit_codes::OK)
}

fn cmd_status(
    project_root: &Path,
    run_id: Option<&str>,
    project_id: Option<&str>,
) -> Result<i32> {
    let records = RunRecordStore::new(project_root);
    match (run_id, project_id) {
        (Some(run_id), _) => {
            let record = records.load(run_id)?;
            let mut payload = serde_json::to_string_pretty(&record)?;
            payload.push('\n');
            print!("{payload}");
        }
        (None, Some(project_id)) => {
            for record in records.list_by_project(project_id)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.run_id,
                    record.status.as_str(),
                    record
                        .reason
                        .map(|reason| reason.as_str())
                        .unwrap_or("-"),
                    record.sprint_id,
                );
            }
        }
        (None, None) => bail!("pass --run-id or --project-id"),
    }
    Ok(exit_codes::OK)
}

/// Iteration budget for a new run. An explicit `--max-iterations 0` is
/// rejected here, matching the settings-level validation.
fn effective_max_iterations(
    requested: Option<u32>,
    settings: &AutomationSettings,
) -> Result<u32> {
    match requested {
        Some(0) => bail!("max-iterations must be at least 1"),
        Some(n) => Ok(n),
        None => Ok(settings.max_iterations()),
    }
}

/// Timestamp plus random suffix; sortable, unique enough for one project.
fn new_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        suffix.to_lowercase()
    )
}

/// Spawn `orchestrator run` detached so the caller returns immediately. The
/// run process records its own pid and writes all progress to the record.
fn spawn_detached_run(project_root: &Path, run_id: &str) -> Result<()> {
    let exe = std::env::current_exe().context("locate orchestrator binary")?;
    ProcessCommand::new(exe)
        .arg("run")
        .arg("--project-root")
        .arg(project_root)
        .arg("--run-id")
        .arg(run_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn run process for {run_id}"))?;
    Ok(())
}

fn kill_process(pid: u32) -> Result<()> {
    let status = ProcessCommand::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .context("invoke kill")?;
    if !status.success() {
        bail!("kill -9 {pid} exited with {status}");
    }
    Ok(())
}
