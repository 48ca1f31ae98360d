//! Scheduler-side wrapper around a submitted task

use accelet_core::{AcceleratorResource, Allocation, TaskId, TaskRef};
use chrono::{DateTime, Utc};

/// A task waiting in, or running from, a leaf queue
#[derive(Debug, Clone)]
pub struct SchedulableTask {
    task: TaskRef,
    /// Full name of the owning leaf queue
    queue: String,
    workload: String,
    submitted_at: DateTime<Utc>,
    allocation: Option<Allocation>,
}

impl SchedulableTask {
    pub fn new(task: TaskRef, queue: impl Into<String>) -> Self {
        let workload = task.workload().to_string();
        Self {
            task,
            queue: queue.into(),
            workload,
            submitted_at: Utc::now(),
            allocation: None,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn task_id(&self) -> &TaskId {
        self.task.task_id()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Time spent since admission
    pub fn submission_duration(&self) -> chrono::Duration {
        Utc::now() - self.submitted_at
    }

    /// Core held while running
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub(crate) fn set_allocation(&mut self, allocation: Allocation) {
        self.allocation = Some(allocation);
    }

    /// Pick a core for this task among `candidates`.
    ///
    /// Every core of `workload` qualifies regardless of its memory; the
    /// fastest one wins and ties go to the candidate seen first.
    pub fn assign_core(
        &self,
        candidates: &[AcceleratorResource],
        workload: &str,
    ) -> Option<AcceleratorResource> {
        let mut matching: Vec<&AcceleratorResource> =
            candidates.iter().filter(|r| r.workload == workload).collect();

        // stable, so equal frequencies keep their order
        matching.sort_by(|a, b| b.core_frequency.cmp(&a.core_frequency));
        matching.first().map(|r| (*r).clone())
    }
}
