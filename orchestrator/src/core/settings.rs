//! Layered agent configuration resolution.
//!
//! Three sources feed the resolver, highest priority first: environment
//! overrides, per-project settings, hardcoded defaults. Resolution happens
//! once at startup; nothing else in the codebase reads configuration
//! ambiently.

use serde::{Deserialize, Serialize};

/// Supported agent binaries, selected by configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Opencode,
}

impl AgentKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "claude" => Some(AgentKind::Claude),
            "opencode" => Some(AgentKind::Opencode),
            _ => None,
        }
    }

    pub fn default_bin(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Opencode => "opencode",
        }
    }

    /// Fallback model when neither environment nor project settings name one.
    ///
    /// The opencode family has no usable default (models are provider-scoped
    /// strings), so an unset model there is a configuration error.
    pub fn default_model(self) -> Option<&'static str> {
        match self {
            AgentKind::Claude => Some("sonnet"),
            AgentKind::Opencode => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Opencode => "opencode",
        }
    }
}

pub const DEFAULT_AGENT_NAME: &str = "claude";
pub const DEFAULT_PERMISSION_MODE: &str = "acceptEdits";

/// Per-project agent settings from `settings.toml`. Every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub name: Option<String>,
    pub bin: Option<String>,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub permission_mode: Option<String>,
}

/// Environment-variable overrides, captured once by the entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOverrides {
    pub name: Option<String>,
    pub bin: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

/// Fully resolved agent invocation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgent {
    pub kind: AgentKind,
    pub bin: String,
    pub model: String,
    pub extra_args: Vec<String>,
    pub permission_mode: String,
}

/// Resolve the agent configuration from its three layered sources.
///
/// Fails on an unknown agent name or when no model can be resolved; both are
/// configuration errors the trigger path must surface before a sandbox is
/// touched.
pub fn resolve_agent(
    overrides: &AgentOverrides,
    project: &AgentSettings,
) -> Result<ResolvedAgent, String> {
    let name = pick(
        overrides.name.as_deref(),
        project.name.as_deref(),
        Some(DEFAULT_AGENT_NAME),
    )
    .expect("default agent name is always present");
    let kind = AgentKind::parse(name)
        .ok_or_else(|| format!("unknown agent '{name}' (expected 'claude' or 'opencode')"))?;

    let bin = pick(
        overrides.bin.as_deref(),
        project.bin.as_deref(),
        Some(kind.default_bin()),
    )
    .expect("default bin is always present")
    .to_string();

    let model = pick(
        overrides.model.as_deref(),
        project.model.as_deref(),
        kind.default_model(),
    )
    .ok_or_else(|| format!("no model configured for agent '{name}' (set a model in settings or the environment)"))?
    .to_string();

    let permission_mode = pick(
        overrides.permission_mode.as_deref(),
        project.permission_mode.as_deref(),
        Some(DEFAULT_PERMISSION_MODE),
    )
    .expect("default permission mode is always present")
    .to_string();

    Ok(ResolvedAgent {
        kind,
        bin,
        model,
        extra_args: project.extra_args.clone(),
        permission_mode,
    })
}

fn pick<'a>(
    env: Option<&'a str>,
    project: Option<&'a str>,
    default: Option<&'a str>,
) -> Option<&'a str> {
    let non_empty = |value: Option<&'a str>| value.map(str::trim).filter(|v| !v.is_empty());
    non_empty(env).or_else(|| non_empty(project)).or(default)
}
