//! Shared domain types for runs and tasks.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// Transitions are monotonic toward a terminal state:
/// `queued -> running -> {completed, failed, stopped, canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    /// Iteration budget exhausted without an explicit completion signal.
    Stopped,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

/// Why a run reached its terminal status. Set only once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Completed,
    MaxIterations,
    Error,
    Canceled,
}

impl RunReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RunReason::Completed => "completed",
            RunReason::MaxIterations => "max_iterations",
            RunReason::Error => "error",
            RunReason::Canceled => "canceled",
        }
    }
}

/// How the agent subprocess is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    #[default]
    Local,
    Docker,
    Cloud,
}

/// Task board status as the CRUD layer models it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    /// Pending tasks are the only tasks a run is allowed to act on.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Todo | TaskStatus::InProgress)
    }
}

/// The task subset the orchestrator reads and writes back.
///
/// Owned by the CRUD layer; the orchestrator only mutates `passes`,
/// `failure_notes`, `files_touched`, `last_run`, and pending-side status
/// transitions for tasks it was authorized to touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: TaskStatus,
    /// Did the agent's own verification succeed.
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub failure_notes: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub last_run: Option<String>,
}

/// One sprint's task board as read from the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBoard {
    #[serde(default)]
    pub sprint_name: String,
    pub tasks: Vec<Task>,
}

impl TaskBoard {
    /// Tasks with status `todo` or `in_progress`, in board order.
    pub fn pending(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|task| task.status.is_pending())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }

    #[test]
    fn pending_filters_to_todo_and_in_progress() {
        let board = TaskBoard {
            sprint_name: "Sprint 1".to_string(),
            tasks: vec![
                task("a", TaskStatus::Backlog),
                task("b", TaskStatus::Todo),
                task("c", TaskStatus::InProgress),
                task("d", TaskStatus::Review),
                task("e", TaskStatus::Done),
            ],
        };

        let ids: Vec<String> = board.pending().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("{id} title"),
            status,
            passes: false,
            failure_notes: None,
            files_touched: Vec::new(),
            last_run: None,
        }
    }
}
