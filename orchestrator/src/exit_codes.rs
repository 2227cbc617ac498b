//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, the run reached a terminal state (possibly
/// `failed`, the record carries the detail).
pub const OK: i32 = 0;
/// Command failed before or outside the run loop (bad layout, missing
/// record, invalid settings).
pub const INVALID: i32 = 1;
