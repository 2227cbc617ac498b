//! Pure, deterministic logic for the orchestrator.
//!
//! No I/O lives here: these modules are fully testable without a git
//! repository, a filesystem, or a child process.

pub mod branch;
pub mod reconcile;
pub mod sentinel;
pub mod settings;
pub mod text;
pub mod types;
