//! Fair scheduler: matches pending tasks to accelerator cores

use accelet_core::{
    AcceleratorConfig, AcceleratorResource, AcceleratorResourceSet, AcceletError, AcceletResult,
    core_index_bases, Allocation, Event, SchedulerConfig, TaskId, TaskRef, TaskUsageReport,
};
use accelet_event::{EventHandler, EventPublisher};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accelerator::{Accelerator, AcceleratorReport};
use crate::queue::{QueueLength, QueueManager};
use crate::schedulable::SchedulableTask;

type TasksMap = HashMap<TaskId, String>;

/// Fair scheduler over the node's accelerator cards.
///
/// Locks are always taken in the order queues, tasks, cards.
pub struct FairScheduler {
    config: SchedulerConfig,
    /// Queue tree holding pending and running tasks
    queues: RwLock<QueueManager>,
    /// Leaf queue of every known task
    tasks: RwLock<TasksMap>,
    /// One lock per card, in configuration order
    cards: Vec<RwLock<Accelerator>>,
    /// Union of every card's capability
    max_share: AcceleratorResourceSet,
    workloads: BTreeSet<String>,
    publisher: EventPublisher,
    /// Cancelled once the scheduler stops admitting tasks
    admission: CancellationToken,
    /// Wakes the heartbeat loop early
    wake: Notify,
}

impl FairScheduler {
    /// Create a scheduler for the configured cards
    pub fn new(
        config: &SchedulerConfig,
        accelerators: &[AcceleratorConfig],
        publisher: EventPublisher,
    ) -> AcceletResult<Self> {
        if accelerators.is_empty() {
            return Err(AcceletError::Config(
                "Cannot schedule without accelerators".to_string(),
            ));
        }

        let mut cards = Vec::with_capacity(accelerators.len());
        let mut max_share = AcceleratorResourceSet::new();
        let bases = core_index_bases(accelerators)?;
        for (index, (accelerator, base)) in accelerators.iter().zip(bases).enumerate() {
            let card = Accelerator::new(accelerator, index, base)?;
            max_share.add_all(card.resource_capability().iter().cloned());
            cards.push(RwLock::new(card));
        }
        let workloads = max_share.workloads();

        info!(
            cards = cards.len(),
            cores = max_share.num(),
            workloads = ?workloads,
            interval_ms = config.interval_ms,
            "Scheduler initialized"
        );

        Ok(Self {
            config: config.clone(),
            queues: RwLock::new(QueueManager::new()),
            tasks: RwLock::new(HashMap::new()),
            cards,
            max_share,
            workloads,
            publisher,
            admission: CancellationToken::new(),
            wake: Notify::new(),
        })
    }

    /// Leaf queue a task is admitted to
    pub fn queue_name(task_id: &TaskId) -> String {
        format!("{}.{}", task_id.workload, task_id.user_app_id)
    }

    /// Capability of the whole node
    pub fn max_share(&self) -> &AcceleratorResourceSet {
        &self.max_share
    }

    /// Whether any card has a core for `workload`
    pub fn supports_workload(&self, workload: &str) -> bool {
        self.workloads.contains(workload)
    }

    /// Admit a task into its leaf queue
    pub async fn add_task(&self, task: TaskRef) -> AcceletResult<()> {
        let task_id = task.task_id().clone();
        if self.admission.is_cancelled() {
            return Err(AcceletError::AdmissionClosed(task_id.to_string()));
        }

        let mut queues = self.queues.write().await;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task_id) {
            return Err(AcceletError::Scheduler(format!(
                "Task {} was already added",
                task_id
            )));
        }

        let queue_name = Self::queue_name(&task_id);
        let queue = queues.get_leaf_queue(&queue_name, true)?.ok_or_else(|| {
            AcceletError::Scheduler(format!("{} is not a leaf queue", queue_name))
        })?;
        let full_name = queue.name().to_string();
        queue.push_pending(SchedulableTask::new(task.clone(), full_name.clone()));
        tasks.insert(task_id.clone(), full_name.clone());

        if !self.supports_workload(task.workload()) {
            warn!(
                task_id = %task_id,
                workload = %task.workload(),
                "No card serves this workload; task stays pending"
            );
        }
        info!(task_id = %task_id, queue = %full_name, "Task added");
        Ok(())
    }

    /// Drop a task that is still pending.
    ///
    /// Returns `false` if the task is already running.
    pub async fn remove_task(&self, task_id: &TaskId) -> AcceletResult<bool> {
        let mut queues = self.queues.write().await;
        let mut tasks = self.tasks.write().await;

        let queue_name = tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AcceletError::TaskNotFound(task_id.to_string()))?;
        let queue = queues
            .get_mut(&queue_name)
            .ok_or_else(|| AcceletError::QueueNotFound(queue_name.clone()))?;

        if queue.remove_pending(task_id).is_none() {
            return Ok(false);
        }
        tasks.remove(task_id);
        info!(task_id = %task_id, queue = %queue_name, "Task removed");
        Ok(true)
    }

    /// Run one scheduling pass and return the number of tasks launched.
    ///
    /// Each round offers one core to the head of every leaf queue in
    /// fair-share order; rounds repeat until one launches nothing.
    pub async fn schedule(&self) -> usize {
        let mut queues = self.queues.write().await;
        let mut launched = 0;

        loop {
            let order = queues.scheduling_order(|workload| self.config.weight(workload));
            let mut round = 0;

            for name in order {
                let Some(queue) = queues.get_mut(&name) else {
                    continue;
                };
                let Some(head) = queue.head() else {
                    continue;
                };
                let task_id = head.task_id().clone();
                let workload = head.workload().to_string();

                let mut candidates = Vec::new();
                for card in &self.cards {
                    candidates.extend(card.read().await.available_cores(&workload));
                }
                let Some(resource) = head.assign_core(&candidates, &workload) else {
                    debug!(task_id = %task_id, queue = %name, "No core available");
                    continue;
                };

                let Some(allocation) = self.assign(&task_id, resource).await else {
                    continue;
                };
                let Some(task) = queue.promote_head(allocation.clone()) else {
                    continue;
                };

                info!(
                    task_id = %task_id,
                    queue = %name,
                    card = %allocation.card_id,
                    core = allocation.resource.core_id,
                    frequency = allocation.resource.core_frequency,
                    "Launching task"
                );
                if let Err(e) = self.publisher.publish(Event::LaunchTask { task, allocation }) {
                    error!(task_id = %task_id, error = %e, "Failed to publish launch");
                }
                round += 1;
            }

            launched += round;
            if round == 0 {
                break;
            }
        }

        launched
    }

    /// Mark `resource` used on the card that owns it
    async fn assign(&self, owner: &TaskId, resource: AcceleratorResource) -> Option<Allocation> {
        for card in &self.cards {
            let mut card = card.write().await;
            if card.owns(&resource) {
                card.assign(owner, resource.clone());
                return Some(Allocation {
                    card_id: card.card_id().to_string(),
                    card_index: card.card_index(),
                    worker: card.worker(),
                    resource,
                });
            }
        }
        error!(task_id = %owner, resource = %resource, "No card owns the chosen core");
        None
    }

    /// Release the core of a finished task and forget the task.
    ///
    /// Completions for tasks that are unknown or not running are logged and
    /// ignored, so a core is released at most once.
    pub async fn complete_task(&self, task_id: &TaskId) -> Option<AcceleratorResource> {
        let mut queues = self.queues.write().await;
        let mut tasks = self.tasks.write().await;

        let Some(queue_name) = tasks.get(task_id).cloned() else {
            warn!(task_id = %task_id, "Completion for unknown task");
            return None;
        };
        let Some(finished) = queues
            .get_mut(&queue_name)
            .and_then(|q| q.remove_running(task_id))
        else {
            warn!(task_id = %task_id, queue = %queue_name, "Completion for task that is not running");
            return None;
        };
        tasks.remove(task_id);

        let allocation = finished.allocation()?;
        let resource = self.cards[allocation.card_index]
            .write()
            .await
            .release(task_id);

        info!(
            task_id = %task_id,
            card = %allocation.card_id,
            core = resource.core_id,
            elapsed_ms = finished.submission_duration().num_milliseconds(),
            "Task completed, core released"
        );
        Some(resource)
    }

    /// Remove a queue that no longer holds anything
    pub async fn prune_queue(&self, name: &str) -> bool {
        self.queues.write().await.remove_queue_if_empty(name)
    }

    /// Share of the node a queue is entitled to
    pub async fn fair_share(&self, name: &str) -> Option<f64> {
        self.queues.read().await.fair_share(name)
    }

    pub async fn queue_lengths(&self) -> Vec<QueueLength> {
        self.queues.read().await.queue_lengths()
    }

    pub async fn card_report(&self, card_id: &str) -> Option<AcceleratorReport> {
        for card in &self.cards {
            let card = card.read().await;
            if card.card_id() == card_id {
                return Some(card.report());
            }
        }
        None
    }

    pub async fn card_reports(&self) -> Vec<AcceleratorReport> {
        let mut reports = Vec::with_capacity(self.cards.len());
        for card in &self.cards {
            reports.push(card.read().await.report());
        }
        reports
    }

    /// Card and core held by a running task
    pub async fn task_usage_report(&self, task_id: &TaskId) -> Option<TaskUsageReport> {
        let queues = self.queues.read().await;
        let tasks = self.tasks.read().await;

        let running = queues.get(tasks.get(task_id)?)?.find_running(task_id)?;
        Some(TaskUsageReport {
            task_id: task_id.clone(),
            allocation: running.allocation()?.clone(),
            submitted_at: running.submitted_at(),
        })
    }

    /// Spawn the heartbeat loop running a pass every `interval_ms`
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let interval = Duration::from_millis(self.config.interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Scheduler started");

            loop {
                tokio::select! {
                    _ = scheduler.admission.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = scheduler.wake.notified() => {}
                }
                let launched = scheduler.schedule().await;
                if launched > 0 {
                    debug!(launched = launched, "Scheduling pass done");
                }
            }

            info!("Scheduler stopped");
        })
    }

    /// Stop admitting tasks and end the heartbeat loop
    pub fn stop(&self) {
        if self.admission.is_cancelled() {
            warn!("Scheduler already stopped");
            return;
        }
        self.admission.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.admission.is_cancelled()
    }
}

#[async_trait]
impl EventHandler for FairScheduler {
    async fn handle(&self, event: Event) -> AcceletResult<()> {
        match event {
            Event::TaskAdded { task } => match self.add_task(task).await {
                Err(AcceletError::AdmissionClosed(id)) => {
                    warn!(task_id = %id, "Scheduler stopped, task not admitted");
                }
                other => other?,
            },
            Event::TaskRemoved { task_id } => match self.remove_task(&task_id).await {
                Ok(true) => {}
                Ok(false) => warn!(task_id = %task_id, "Cannot remove a running task"),
                Err(e) => warn!(task_id = %task_id, error = %e, "Cannot remove task"),
            },
            Event::TaskFinished { task_id } => {
                self.complete_task(&task_id).await;
            }
            Event::TaskFailed {
                task_id,
                diagnostics,
            } => {
                warn!(task_id = %task_id, diagnostics = %diagnostics, "Task failed");
                self.complete_task(&task_id).await;
            }
            other => {
                return Err(AcceletError::Scheduler(format!(
                    "Unexpected {} event",
                    other.event_type()
                )));
            }
        }

        self.wake.notify_one();
        Ok(())
    }
}
