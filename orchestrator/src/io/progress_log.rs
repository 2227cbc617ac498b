//! Append-only progress logs and the root run journal.
//!
//! Two artifacts: a per-run plain-text progress log inside the sandbox
//! (timestamped blocks, copied to a permanent location at finalization), and
//! the root-level `progress.txt` journal that receives one fixed-format
//! summary block per finished run. Both are product output, written
//! unconditionally regardless of tracing configuration.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::io::run_record::now_rfc3339;

/// Create the sandbox progress log if missing, or note a resume.
pub fn init_progress_log(path: &Path, run_id: &str) -> Result<()> {
    if path.exists() {
        append_block(path, &format!("run {run_id} resumed"), "")?;
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create progress log dir {}", parent.display()))?;
    }
    let header = format!("# progress log for run {run_id}\n");
    fs::write(path, header).with_context(|| format!("write progress log {}", path.display()))?;
    Ok(())
}

/// Append one timestamped block to a progress log.
pub fn append_block(path: &Path, title: &str, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create progress log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open progress log {}", path.display()))?;
    let mut block = format!("\n=== {} {} ===\n", now_rfc3339(), title);
    let body = body.trim_end();
    if !body.is_empty() {
        block.push_str(body);
        block.push('\n');
    }
    file.write_all(block.as_bytes())
        .with_context(|| format!("append progress log {}", path.display()))?;
    Ok(())
}

/// Copy the sandbox progress log to its permanent per-run location.
///
/// A missing source (a run that never reached plan preparation) is not an
/// error; nothing is copied.
pub fn copy_progress_log(sandbox_log: &Path, permanent: &Path) -> Result<bool> {
    if !sandbox_log.exists() {
        return Ok(false);
    }
    if let Some(parent) = permanent.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::copy(sandbox_log, permanent).with_context(|| {
        format!(
            "copy progress log {} -> {}",
            sandbox_log.display(),
            permanent.display()
        )
    })?;
    Ok(true)
}

/// One finished run's summary for the root journal.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub status: &'static str,
    pub reason: &'static str,
    pub agent: String,
    pub passed: usize,
    pub failed: usize,
    pub log_path: String,
}

/// Append the fixed-format summary block for a finished run.
pub fn append_run_summary(journal_path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = journal_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create journal dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path)
        .with_context(|| format!("open journal {}", journal_path.display()))?;
    let block = format!(
        "==================================================\n\
         run:      {}\n\
         status:   {}\n\
         reason:   {}\n\
         agent:    {}\n\
         passed:   {}\n\
         failed:   {}\n\
         log:      {}\n\
         finished: {}\n\
         ==================================================\n",
        summary.run_id,
        summary.status,
        summary.reason,
        summary.agent,
        summary.passed,
        summary.failed,
        summary.log_path,
        now_rfc3339(),
    );
    file.write_all(block.as_bytes())
        .with_context(|| format!("append journal {}", journal_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_append_builds_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.log");

        init_progress_log(&path, "run-1").expect("init");
        append_block(&path, "iteration 1", "agent output here").expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("# progress log for run run-1"));
        assert!(contents.contains("iteration 1 ==="));
        assert!(contents.contains("agent output here"));
    }

    #[test]
    fn reinit_notes_resume_instead_of_truncating() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.log");

        init_progress_log(&path, "run-1").expect("init");
        append_block(&path, "iteration 1", "work").expect("append");
        init_progress_log(&path, "run-1").expect("reinit");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("work"));
        assert!(contents.contains("run run-1 resumed"));
    }

    #[test]
    fn copy_is_a_noop_for_missing_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let copied = copy_progress_log(
            &temp.path().join("missing.log"),
            &temp.path().join("dest.log"),
        )
        .expect("copy");
        assert!(!copied);
        assert!(!temp.path().join("dest.log").exists());
    }

    #[test]
    fn journal_accumulates_summary_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let journal = temp.path().join("progress.txt");

        for run in ["run-1", "run-2"] {
            append_run_summary(
                &journal,
                &RunSummary {
                    run_id: run.to_string(),
                    status: "completed",
                    reason: "completed",
                    agent: "claude".to_string(),
                    passed: 2,
                    failed: 0,
                    log_path: format!(".orchestrator/logs/{run}.log"),
                },
            )
            .expect("append");
        }

        let contents = fs::read_to_string(&journal).expect("read");
        assert!(contents.contains("run:      run-1"));
        assert!(contents.contains("run:      run-2"));
        assert_eq!(contents.matches("status:   completed").count(), 2);
    }
}
