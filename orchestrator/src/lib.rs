//! Autonomous sprint-run orchestrator.
//!
//! Runs a coding agent against a sprint's pending tasks inside a disposable
//! git-worktree sandbox, iterating until the agent signals completion, the
//! iteration budget runs out, an error occurs, or the run is canceled. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (status machines, settings
//!   resolution, task reconciliation). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution, agent invocation).
//!
//! [`run`] coordinates core logic with I/O to drive one run from its queued
//! record to a terminal state.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
