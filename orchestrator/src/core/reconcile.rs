//! Merge sandbox task results back into the root board.
//!
//! Reconciliation is a best-effort, last-write-wins merge: for every task id
//! the run was authorized to touch, the sandbox snapshot's final state is
//! copied onto the root task. Applying the same snapshot twice yields the
//! same board, so a retried sync is safe.

use crate::core::types::{Task, TaskStatus};

/// Apply the sandbox snapshot to `root_tasks` for each selected task id.
///
/// A task missing from the sandbox snapshot (which should not normally
/// happen) is defensively marked `in_progress` so it is never silently
/// treated as finished. Tasks outside `selected_ids` are never touched.
pub fn reconcile_tasks(selected_ids: &[String], sandbox: &[Task], root_tasks: &mut [Task]) {
    for id in selected_ids {
        let Some(root_task) = root_tasks.iter_mut().find(|task| &task.id == id) else {
            continue;
        };
        match sandbox.iter().find(|task| &task.id == id) {
            Some(sandbox_task) => {
                root_task.passes = sandbox_task.passes;
                root_task.files_touched = sandbox_task.files_touched.clone();
                root_task.last_run = sandbox_task.last_run.clone();
                if sandbox_task.passes {
                    root_task.status = TaskStatus::Review;
                    root_task.failure_notes = None;
                } else {
                    root_task.status = TaskStatus::InProgress;
                    root_task.failure_notes = sandbox_task.failure_notes.clone();
                }
            }
            None => {
                root_task.status = TaskStatus::InProgress;
            }
        }
    }
}

/// Passed/failed counts over the selected task ids, for the run summary.
pub fn pass_fail_counts(selected_ids: &[String], sandbox: &[Task]) -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    for id in selected_ids {
        match sandbox.iter().find(|task| &task.id == id) {
            Some(task) if task.passes => passed += 1,
            _ => failed += 1,
        }
    }
    (passed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, passes: bool) -> Task {
        Task {
            id: id.to_string(),
            title: format!("{id} title"),
            status,
            passes,
            failure_notes: None,
            files_touched: Vec::new(),
            last_run: None,
        }
    }

    #[test]
    fn passing_task_moves_to_review() {
        let selected = vec!["t1".to_string()];
        let mut sandbox_task = task("t1", TaskStatus::InProgress, true);
        sandbox_task.files_touched = vec!["src/lib.rs".to_string()];
        sandbox_task.last_run = Some("2026-08-29T10:00:00Z".to_string());
        let mut root = vec![task("t1", TaskStatus::Todo, false)];

        reconcile_tasks(&selected, &[sandbox_task], &mut root);

        assert_eq!(root[0].status, TaskStatus::Review);
        assert!(root[0].passes);
        assert_eq!(root[0].failure_notes, None);
        assert_eq!(root[0].files_touched, vec!["src/lib.rs".to_string()]);
        assert!(root[0].last_run.is_some());
    }

    #[test]
    fn failing_task_stays_in_progress_with_notes() {
        let selected = vec!["t1".to_string()];
        let mut sandbox_task = task("t1", TaskStatus::InProgress, false);
        sandbox_task.failure_notes = Some("tests failed".to_string());
        let mut root = vec![task("t1", TaskStatus::Todo, false)];

        reconcile_tasks(&selected, &[sandbox_task], &mut root);

        assert_eq!(root[0].status, TaskStatus::InProgress);
        assert_eq!(root[0].failure_notes, Some("tests failed".to_string()));
    }

    #[test]
    fn task_missing_from_sandbox_is_marked_in_progress() {
        let selected = vec!["gone".to_string()];
        let mut root = vec![task("gone", TaskStatus::Todo, false)];

        reconcile_tasks(&selected, &[], &mut root);

        assert_eq!(root[0].status, TaskStatus::InProgress);
    }

    #[test]
    fn unselected_tasks_are_untouched() {
        let selected = vec!["t1".to_string()];
        let sandbox = vec![task("t1", TaskStatus::InProgress, true)];
        let mut root = vec![
            task("t1", TaskStatus::Todo, false),
            task("t2", TaskStatus::Todo, false),
        ];

        reconcile_tasks(&selected, &sandbox, &mut root);

        assert_eq!(root[1].status, TaskStatus::Todo);
        assert!(!root[1].passes);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let selected = vec!["t1".to_string(), "t2".to_string()];
        let mut failing = task("t2", TaskStatus::InProgress, false);
        failing.failure_notes = Some("broken".to_string());
        let sandbox = vec![task("t1", TaskStatus::InProgress, true), failing];
        let mut root = vec![
            task("t1", TaskStatus::Todo, false),
            task("t2", TaskStatus::Todo, false),
        ];

        reconcile_tasks(&selected, &sandbox, &mut root);
        let after_first = root.clone();
        reconcile_tasks(&selected, &sandbox, &mut root);

        assert_eq!(root, after_first);
    }

    #[test]
    fn counts_tally_passed_and_failed() {
        let selected = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        let sandbox = vec![
            task("a", TaskStatus::InProgress, true),
            task("b", TaskStatus::InProgress, false),
        ];

        assert_eq!(pass_fail_counts(&selected, &sandbox), (1, 2));
    }
}
