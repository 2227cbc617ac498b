//! Child process execution with explicit invocation modes and bounded output.
//!
//! Every subprocess the orchestrator launches goes through [`CommandRunner`]
//! so the dashboard-visible run record can always show the most recent
//! command and its exit code. A non-zero exit is data, not an error; only a
//! spawn failure (binary not found) is an `Err`, distinguishable by
//! downcasting to [`SpawnFailed`].

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How the command string is interpreted. Always explicit, never inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// A single string handed to `sh -c`.
    Shell(String),
    /// Program plus arguments, no shell involved.
    Argv(Vec<String>),
}

impl Invocation {
    /// Human-readable form recorded into the run record.
    pub fn display(&self) -> String {
        match self {
            Invocation::Shell(command) => command.clone(),
            Invocation::Argv(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub invocation: Invocation,
    pub cwd: PathBuf,
    /// Extra variables merged over the parent environment.
    pub env: Vec<(String, String)>,
    /// `None` means wait indefinitely (agent invocations are bounded by the
    /// iteration budget, not a wall clock).
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl CommandRequest {
    pub fn new(invocation: Invocation, cwd: impl Into<PathBuf>) -> Self {
        Self {
            invocation,
            cwd: cwd.into(),
            env: Vec::new(),
            timeout: None,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Captured child process result.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the child was killed by a signal (including timeout).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, as scanned for completion signals.
    pub fn combined(&self) -> String {
        let mut buf = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        buf.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&self.stderr);
        }
        buf
    }
}

/// Process-launch failure, distinct from a non-zero exit.
#[derive(Debug)]
pub struct SpawnFailed {
    pub command: String,
    pub source: std::io::Error,
}

impl fmt::Display for SpawnFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to spawn '{}': {}", self.command, self.source)
    }
}

impl std::error::Error for SpawnFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Sees every command the runner executes; the run-record backed observer
/// feeds `last_command`/`last_command_exit_code` for the polling dashboard.
pub trait CommandObserver {
    fn command_started(&self, command: &str);
    fn command_finished(&self, command: &str, exit_code: Option<i32>);
}

/// Observer that records nothing.
pub struct NoopObserver;

impl CommandObserver for NoopObserver {
    fn command_started(&self, _command: &str) {}
    fn command_finished(&self, _command: &str, _exit_code: Option<i32>) {}
}

pub struct CommandRunner {
    observer: Box<dyn CommandObserver>,
}

impl CommandRunner {
    pub fn new(observer: Box<dyn CommandObserver>) -> Self {
        Self { observer }
    }

    pub fn silent() -> Self {
        Self::new(Box::new(NoopObserver))
    }

    /// Run the command to completion, draining output on reader threads so a
    /// chatty child can never deadlock the pipe.
    #[instrument(skip_all, fields(cwd = %request.cwd.display()))]
    pub fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let shown = request.invocation.display();
        let mut cmd = build_command(&request.invocation)?;
        cmd.current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        self.observer.command_started(&shown);
        debug!(command = %shown, "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.observer.command_finished(&shown, None);
                return Err(anyhow::Error::new(SpawnFailed {
                    command: shown,
                    source,
                }));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let limit = request.output_limit_bytes;
        let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

        let mut timed_out = false;
        let status = match request.timeout {
            Some(timeout) => match child.wait_timeout(timeout).context("wait for command")? {
                Some(status) => status,
                None => {
                    warn!(command = %shown, timeout_secs = timeout.as_secs(), "command timed out, killing");
                    timed_out = true;
                    child.kill().context("kill command")?;
                    child.wait().context("wait command after kill")?
                }
            },
            None => child.wait().context("wait for command")?,
        };

        let stdout = join_output(stdout_handle).context("join stdout")?;
        let stderr = join_output(stderr_handle).context("join stderr")?;
        let exit_code = status.code();

        self.observer.command_finished(&shown, exit_code);
        debug!(command = %shown, ?exit_code, timed_out, "command finished");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }
}

fn build_command(invocation: &Invocation) -> Result<Command> {
    match invocation {
        Invocation::Shell(line) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            Ok(cmd)
        }
        Invocation::Argv(argv) => {
            let program = argv
                .first()
                .ok_or_else(|| anyhow!("argv invocation requires at least a program name"))?;
            let mut cmd = Command::new(program);
            cmd.args(&argv[1..]);
            Ok(cmd)
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<String>>) -> Result<String> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<String> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    if truncated > 0 {
        warn!(truncated, "output truncated");
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingObserver {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CommandObserver for RecordingObserver {
        fn command_started(&self, command: &str) {
            self.events.lock().unwrap().push(format!("start {command}"));
        }
        fn command_finished(&self, command: &str, exit_code: Option<i32>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish {command} {exit_code:?}"));
        }
    }

    fn shell(line: &str) -> CommandRequest {
        CommandRequest::new(
            Invocation::Shell(line.to_string()),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn shell_invocation_captures_stdout() {
        let runner = CommandRunner::silent();
        let output = runner.run(&shell("echo hello")).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert!(!output.timed_out);
    }

    #[test]
    fn nonzero_exit_is_reported_not_thrown() {
        let runner = CommandRunner::silent();
        let output = runner.run(&shell("exit 3")).expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn argv_invocation_does_not_use_a_shell() {
        let runner = CommandRunner::silent();
        let request = CommandRequest::new(
            Invocation::Argv(vec!["echo".to_string(), "$HOME".to_string()]),
            std::env::temp_dir(),
        );
        let output = runner.run(&request).expect("run");
        // Without a shell the variable is not expanded.
        assert_eq!(output.stdout.trim(), "$HOME");
    }

    #[test]
    fn spawn_failure_downcasts_to_spawn_failed() {
        let runner = CommandRunner::silent();
        let request = CommandRequest::new(
            Invocation::Argv(vec!["definitely-not-a-real-binary-xyz".to_string()]),
            std::env::temp_dir(),
        );
        let err = runner.run(&request).unwrap_err();
        assert!(err.downcast_ref::<SpawnFailed>().is_some());
    }

    #[test]
    fn env_is_merged_over_parent() {
        let runner = CommandRunner::silent();
        let mut request = shell("echo $ORCH_TEST_VALUE");
        request.env = vec![("ORCH_TEST_VALUE".to_string(), "injected".to_string())];
        let output = runner.run(&request).expect("run");
        assert_eq!(output.stdout.trim(), "injected");
    }

    #[test]
    fn timeout_kills_the_child() {
        let runner = CommandRunner::silent();
        let mut request = shell("sleep 5");
        request.timeout = Some(Duration::from_millis(100));
        let output = runner.run(&request).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn observer_sees_start_and_exit_code() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let runner = CommandRunner::new(Box::new(RecordingObserver {
            events: events.clone(),
        }));
        runner.run(&shell("exit 2")).expect("run");
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("start "));
        assert!(events[1].contains("Some(2)"));
    }

    #[test]
    fn output_limit_truncates_but_still_drains() {
        let runner = CommandRunner::silent();
        let mut request = shell("yes x | head -c 100000");
        request.output_limit_bytes = 1000;
        let output = runner.run(&request).expect("run");
        assert!(output.stdout.len() <= 1000);
        assert!(output.success());
    }

    #[test]
    fn combined_concatenates_streams() {
        let output = CommandOutput {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit_code: Some(0),
            timed_out: false,
        };
        assert_eq!(output.combined(), "out\nerr");
    }
}
