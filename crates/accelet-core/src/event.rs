//! Events exchanged between the scheduler, the launcher and task bookkeeping

use crate::task::{Allocation, TaskId, TaskRef};

/// Discriminator used to route an event to its handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// A task was admitted and should be queued
    TaskAdded,
    /// A pending task should be dropped from its queue
    TaskRemoved,
    /// A task was matched to a core and should be executed
    LaunchTask,
    /// A task's leftovers should be cleaned up
    CleanupTask,
    /// A task ran to success
    TaskFinished,
    /// A task ended in any other terminal state
    TaskFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::TaskAdded => write!(f, "TASK_ADDED"),
            EventType::TaskRemoved => write!(f, "TASK_REMOVED"),
            EventType::LaunchTask => write!(f, "LAUNCH_TASK"),
            EventType::CleanupTask => write!(f, "CLEANUP_TASK"),
            EventType::TaskFinished => write!(f, "TASK_FINISHED"),
            EventType::TaskFailed => write!(f, "TASK_FAILED"),
        }
    }
}

/// An immutable event published on the dispatcher
#[derive(Debug, Clone)]
pub enum Event {
    TaskAdded {
        task: TaskRef,
    },
    TaskRemoved {
        task_id: TaskId,
    },
    LaunchTask {
        task: TaskRef,
        allocation: Allocation,
    },
    CleanupTask {
        task: TaskRef,
    },
    TaskFinished {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        diagnostics: String,
    },
}

impl Event {
    /// Routing tag of this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TaskAdded { .. } => EventType::TaskAdded,
            Event::TaskRemoved { .. } => EventType::TaskRemoved,
            Event::LaunchTask { .. } => EventType::LaunchTask,
            Event::CleanupTask { .. } => EventType::CleanupTask,
            Event::TaskFinished { .. } => EventType::TaskFinished,
            Event::TaskFailed { .. } => EventType::TaskFailed,
        }
    }

    /// Id of the task the event is about
    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::TaskAdded { task }
            | Event::LaunchTask { task, .. }
            | Event::CleanupTask { task } => task.task_id(),
            Event::TaskRemoved { task_id }
            | Event::TaskFinished { task_id }
            | Event::TaskFailed { task_id, .. } => task_id,
        }
    }
}
