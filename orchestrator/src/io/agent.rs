//! Coding-agent subprocess invocation.
//!
//! The [`AgentInvoker`] trait decouples the run loop from the actual agent
//! binary. Tests use scripted invokers that return predetermined output
//! without spawning processes; production uses [`CliAgentInvoker`], which
//! builds the argv for the configured agent family and executor mode.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::settings::{AgentKind, ResolvedAgent};
use crate::core::types::ExecutorMode;
use crate::io::process::{CommandRequest, CommandRunner, Invocation};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Sandbox directory the agent works in.
    pub workdir: PathBuf,
    pub prompt: String,
    pub output_limit_bytes: usize,
}

/// What the run loop inspects after an invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub exit_code: Option<i32>,
    /// Combined stdout+stderr, scanned in full for the completion sentinel.
    pub output: String,
}

impl AgentResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Abstraction over agent execution backends.
pub trait AgentInvoker {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResult>;

    /// Short human-readable name for run summaries.
    fn describe(&self) -> String;
}

/// Invoker that spawns the configured agent binary through the command
/// runner, so each invocation shows up in the run record.
pub struct CliAgentInvoker {
    agent: ResolvedAgent,
    mode: ExecutorMode,
    docker_image: Option<String>,
    runner: CommandRunner,
}

impl CliAgentInvoker {
    /// Build an invoker, rejecting unusable executor configurations up front.
    pub fn new(
        agent: ResolvedAgent,
        mode: ExecutorMode,
        docker_image: Option<String>,
        runner: CommandRunner,
    ) -> Result<Self> {
        match mode {
            ExecutorMode::Local => {}
            ExecutorMode::Docker => {
                if docker_image.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(anyhow!(
                        "docker executor mode requires docker_image in settings"
                    ));
                }
            }
            ExecutorMode::Cloud => {
                return Err(anyhow!("cloud executor mode is not supported by this build"));
            }
        }
        Ok(Self {
            agent,
            mode,
            docker_image,
            runner,
        })
    }

    fn build_argv(&self, request: &AgentRequest) -> Vec<String> {
        let mut argv = Vec::new();
        if self.mode == ExecutorMode::Docker {
            let image = self
                .docker_image
                .as_deref()
                .expect("docker image checked at construction");
            argv.extend(["docker", "run", "--rm", "-v"].map(String::from));
            argv.push(format!("{}:/workspace", request.workdir.display()));
            argv.extend(["-w", "/workspace"].map(String::from));
            argv.push(image.to_string());
        }

        argv.push(self.agent.bin.clone());
        argv.extend(self.agent.extra_args.iter().cloned());
        argv.push("--model".to_string());
        argv.push(self.agent.model.clone());
        if self.agent.kind == AgentKind::Claude {
            argv.push("--permission-mode".to_string());
            argv.push(self.agent.permission_mode.clone());
        }
        argv.push("-p".to_string());
        argv.push(request.prompt.clone());
        argv
    }
}

impl AgentInvoker for CliAgentInvoker {
    #[instrument(skip_all, fields(agent = self.agent.kind.as_str(), workdir = %request.workdir.display()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResult> {
        info!(model = %self.agent.model, "invoking coding agent");
        let argv = self.build_argv(request);
        let command_request = CommandRequest {
            invocation: Invocation::Argv(argv),
            cwd: request.workdir.clone(),
            env: Vec::new(),
            // The iteration budget bounds the run, not a wall clock.
            timeout: None,
            output_limit_bytes: request.output_limit_bytes,
        };

        let output = self.runner.run(&command_request)?;
        debug!(exit_code = ?output.exit_code, "agent finished");
        Ok(AgentResult {
            exit_code: output.exit_code,
            output: output.combined(),
        })
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.agent.kind.as_str(), self.agent.model)
    }
}
