//! Side-effecting adapters: filesystem, git, processes, stores.

pub mod agent;
pub mod git;
pub mod paths;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod run_record;
pub mod sandbox;
pub mod task_store;
