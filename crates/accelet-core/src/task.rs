//! Task abstraction shared by the scheduler and the launcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::resource::{AcceleratorResource, WorkerType};

/// Identifies one task of a user application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    /// Daemon-side application id
    pub daemon_app_id: Uuid,
    /// Application id chosen by the submitting user
    pub user_app_id: String,
    /// Requested workload
    pub workload: String,
    /// Sequence number among tasks of the same workload
    pub index: u32,
}

impl TaskId {
    /// Create a task id under a fresh daemon application id
    pub fn new(user_app_id: impl Into<String>, workload: impl Into<String>, index: u32) -> Self {
        Self {
            daemon_app_id: Uuid::new_v4(),
            user_app_id: user_app_id.into(),
            workload: workload.into(),
            index,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task_{}_{:04}_{}",
            self.workload, self.index, self.user_app_id
        )
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in a queue for a core
    Pending,
    /// Matched to a core and handed to the launcher
    Running,
    /// Work function returned successfully
    ExitedWithSuccess,
    /// Work function failed or panicked
    ExitedWithFailure,
    /// Stopped before completion
    Killed,
}

impl TaskState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::ExitedWithSuccess | TaskState::ExitedWithFailure | TaskState::Killed
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::Running => write!(f, "Running"),
            TaskState::ExitedWithSuccess => write!(f, "ExitedWithSuccess"),
            TaskState::ExitedWithFailure => write!(f, "ExitedWithFailure"),
            TaskState::Killed => write!(f, "Killed"),
        }
    }
}

/// A unit of user work that runs against an accelerator core.
///
/// `run` may block on device or storage I/O; it is always invoked on the
/// launcher's worker pool, never on the dispatcher.
pub trait Task: Send + Sync {
    /// Task identifier
    fn task_id(&self) -> &TaskId;

    /// Workload the task needs a core for
    fn workload(&self) -> &str;

    /// Execute the work function and return a terminal state
    fn run(&self) -> TaskState;

    /// Human-readable diagnostics collected while running
    fn diagnostics(&self) -> String;

    /// Release whatever `run` left behind
    fn cleanup(&self) -> TaskState {
        TaskState::ExitedWithSuccess
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.task_id().to_string())
            .field("workload", &self.workload())
            .finish()
    }
}

/// Shared handle to a task
pub type TaskRef = Arc<dyn Task>;

/// Core assigned to a task by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Hardware id of the card
    pub card_id: String,
    /// Position of the card in configuration order
    pub card_index: usize,
    /// Device kind of the card
    pub worker: WorkerType,
    /// The assigned core
    pub resource: AcceleratorResource,
}

/// Resource usage of a running task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUsageReport {
    pub task_id: TaskId,
    pub allocation: Allocation,
    /// When the task was admitted to its queue
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopTask {
        id: TaskId,
    }

    impl Task for NoopTask {
        fn task_id(&self) -> &TaskId {
            &self.id
        }

        fn workload(&self) -> &str {
            &self.id.workload
        }

        fn run(&self) -> TaskState {
            TaskState::ExitedWithSuccess
        }

        fn diagnostics(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new("app1", "kmeans", 7);
        assert_eq!(id.to_string(), "task_kmeans_0007_app1");
    }

    #[test]
    fn test_task_ids_are_distinct_per_app() {
        let a = TaskId::new("app1", "kmeans", 0);
        let b = TaskId::new("app1", "kmeans", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::ExitedWithSuccess.is_terminal());
        assert!(TaskState::ExitedWithFailure.is_terminal());
        assert!(TaskState::Killed.is_terminal());
    }

    #[test]
    fn test_default_cleanup_and_debug() {
        let task: TaskRef = Arc::new(NoopTask {
            id: TaskId::new("app1", "loopback", 1),
        });
        assert_eq!(task.cleanup(), TaskState::ExitedWithSuccess);
        let debug = format!("{:?}", task);
        assert!(debug.contains("task_loopback_0001_app1"));
    }
}
