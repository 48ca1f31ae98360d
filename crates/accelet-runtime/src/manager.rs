//! Task bookkeeping: creates tasks, submits them and follows their state

use accelet_core::{
    is_workload_name_valid, AcceletError, AcceletResult, Event, TaskId, TaskRef, TaskState,
    WorkloadConfig,
};
use accelet_event::{EventHandler, EventPublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use crate::process::ProcessTask;

/// What the manager knows about one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Card the task was launched on
    pub card_id: Option<String>,
    pub diagnostics: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ManagerState {
    records: HashMap<TaskId, TaskRecord>,
    /// Next task index per workload
    next_index: HashMap<String, u32>,
}

/// Creates tasks and tracks them until they end
pub struct TaskManager {
    workloads: BTreeMap<String, WorkloadConfig>,
    publisher: EventPublisher,
    state: RwLock<ManagerState>,
    settled: Notify,
}

impl TaskManager {
    pub fn new(workloads: BTreeMap<String, WorkloadConfig>, publisher: EventPublisher) -> Self {
        Self {
            workloads,
            publisher,
            state: RwLock::new(ManagerState::default()),
            settled: Notify::new(),
        }
    }

    /// Create a process task for `workload` and submit it
    pub async fn create_task(&self, user_app_id: &str, workload: &str) -> AcceletResult<TaskId> {
        if user_app_id.is_empty() || user_app_id.trim() != user_app_id || user_app_id.contains('.')
        {
            return Err(AcceletError::Config(format!(
                "Illegal application id {:?}",
                user_app_id
            )));
        }
        if !is_workload_name_valid(workload) {
            return Err(AcceletError::Config(format!(
                "Illegal workload name {:?}",
                workload
            )));
        }
        let config = self.workloads.get(workload).ok_or_else(|| {
            AcceletError::Config(format!("No program configured for workload {}", workload))
        })?;

        let index = {
            let mut state = self.state.write().await;
            let next = state.next_index.entry(workload.to_string()).or_insert(0);
            let index = *next;
            *next += 1;
            index
        };

        let task_id = TaskId::new(user_app_id, workload, index);
        self.submit(Arc::new(ProcessTask::new(task_id.clone(), config.clone())))
            .await?;
        Ok(task_id)
    }

    /// Track `task` and publish it for scheduling
    pub async fn submit(&self, task: TaskRef) -> AcceletResult<()> {
        if !is_workload_name_valid(task.workload()) {
            return Err(AcceletError::Config(format!(
                "Illegal workload name {:?}",
                task.workload()
            )));
        }
        let task_id = task.task_id().clone();
        self.state.write().await.records.insert(
            task_id.clone(),
            TaskRecord {
                task_id: task_id.clone(),
                state: TaskState::Pending,
                card_id: None,
                diagnostics: None,
                created_at: Utc::now(),
                finished_at: None,
            },
        );

        info!(task_id = %task_id, workload = %task.workload(), "Submitting task");
        if let Err(e) = self.publisher.publish(Event::TaskAdded { task }) {
            self.state.write().await.records.remove(&task_id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.state.read().await.records.get(task_id).cloned()
    }

    /// All records, oldest first
    pub async fn records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> =
            self.state.read().await.records.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Whether every tracked task reached a terminal state
    pub async fn is_settled(&self) -> bool {
        self.state
            .read()
            .await
            .records
            .values()
            .all(|r| r.state.is_terminal())
    }

    /// Wait until every tracked task reached a terminal state
    pub async fn wait_all(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_settled().await {
                return;
            }
            notified.await;
        }
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        state: TaskState,
        card_id: Option<String>,
        diagnostics: Option<String>,
    ) {
        let mut guard = self.state.write().await;
        let Some(record) = guard.records.get_mut(task_id) else {
            debug!(task_id = %task_id, "Ignoring state change of untracked task");
            return;
        };
        if record.state.is_terminal() {
            debug!(task_id = %task_id, state = %record.state, "Task already ended");
            return;
        }

        debug!(task_id = %task_id, from = %record.state, to = %state, "Task state changed");
        record.state = state;
        if card_id.is_some() {
            record.card_id = card_id;
        }
        if diagnostics.is_some() {
            record.diagnostics = diagnostics;
        }
        if state.is_terminal() {
            record.finished_at = Some(Utc::now());
            drop(guard);
            self.settled.notify_waiters();
        }
    }
}

#[async_trait]
impl EventHandler for TaskManager {
    async fn handle(&self, event: Event) -> AcceletResult<()> {
        match event {
            Event::LaunchTask { task, allocation } => {
                self.transition(
                    task.task_id(),
                    TaskState::Running,
                    Some(allocation.card_id),
                    None,
                )
                .await
            }
            Event::TaskFinished { task_id } => {
                self.transition(&task_id, TaskState::ExitedWithSuccess, None, None)
                    .await
            }
            Event::TaskFailed {
                task_id,
                diagnostics,
            } => {
                self.transition(
                    &task_id,
                    TaskState::ExitedWithFailure,
                    None,
                    Some(diagnostics),
                )
                .await
            }
            other => {
                return Err(AcceletError::Task(format!(
                    "Unexpected {} event",
                    other.event_type()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelet_core::{AcceleratorResource, Allocation, DispatcherConfig, EventType, WorkerType};
    use accelet_event::AsyncDispatcher;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Added {
        seen: mpsc::UnboundedSender<TaskRef>,
    }

    #[async_trait]
    impl EventHandler for Added {
        async fn handle(&self, event: Event) -> AcceletResult<()> {
            if let Event::TaskAdded { task } = event {
                let _ = self.seen.send(task);
            }
            Ok(())
        }
    }

    fn workloads() -> BTreeMap<String, WorkloadConfig> {
        let mut workloads = BTreeMap::new();
        workloads.insert(
            "kmeans".to_string(),
            WorkloadConfig {
                command: PathBuf::from("/bin/true"),
                args: Vec::new(),
            },
        );
        workloads
    }

    async fn create_test_manager() -> (
        TaskManager,
        AsyncDispatcher,
        mpsc::UnboundedReceiver<TaskRef>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut dispatcher = AsyncDispatcher::new(&DispatcherConfig::default());
        dispatcher
            .register(EventType::TaskAdded, Arc::new(Added { seen: tx }))
            .await;
        dispatcher.start().unwrap();
        let manager = TaskManager::new(workloads(), dispatcher.event_handler());
        (manager, dispatcher, rx)
    }

    fn launch(task: TaskRef) -> Event {
        Event::LaunchTask {
            task,
            allocation: Allocation {
                card_id: "fpga-0".to_string(),
                card_index: 0,
                worker: WorkerType::Fpga,
                resource: AcceleratorResource::new("kmeans", 0, 200, 0),
            },
        }
    }

    #[tokio::test]
    async fn test_create_task_indexes_per_workload() {
        let (manager, mut dispatcher, mut added) = create_test_manager().await;

        let first = manager.create_task("app1", "kmeans").await.unwrap();
        let second = manager.create_task("app2", "kmeans").await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(added.recv().await.unwrap().task_id(), &first);
        assert_eq!(added.recv().await.unwrap().task_id(), &second);
        assert_eq!(manager.get(&first).await.unwrap().state, TaskState::Pending);
        assert_eq!(manager.records().await.len(), 2);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_create_task_rejects_bad_input() {
        let (manager, mut dispatcher, _added) = create_test_manager().await;

        for bad in ["", " app1", "app1 ", "app.1"] {
            assert!(matches!(
                manager.create_task(bad, "kmeans").await,
                Err(AcceletError::Config(_))
            ));
        }
        assert!(matches!(
            manager.create_task("app1", "sha256").await,
            Err(AcceletError::Config(_))
        ));
        for bad in ["kmeans ", "k.means", "root"] {
            assert!(matches!(
                manager.create_task("app1", bad).await,
                Err(AcceletError::Config(_))
            ));
        }
        let dotted: TaskRef = Arc::new(ProcessTask::new(
            TaskId::new("app1", "k.means", 0),
            workloads()["kmeans"].clone(),
        ));
        assert!(matches!(
            manager.submit(dotted).await,
            Err(AcceletError::Config(_))
        ));
        assert!(manager.records().await.is_empty());

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_state_follows_events() {
        let (manager, mut dispatcher, mut added) = create_test_manager().await;

        let ok = manager.create_task("app1", "kmeans").await.unwrap();
        let bad = manager.create_task("app2", "kmeans").await.unwrap();
        let ok_task = added.recv().await.unwrap();
        let bad_task = added.recv().await.unwrap();
        assert!(!manager.is_settled().await);

        manager.handle(launch(ok_task)).await.unwrap();
        manager.handle(launch(bad_task)).await.unwrap();
        let record = manager.get(&ok).await.unwrap();
        assert_eq!(record.state, TaskState::Running);
        assert_eq!(record.card_id.as_deref(), Some("fpga-0"));

        manager
            .handle(Event::TaskFinished {
                task_id: ok.clone(),
            })
            .await
            .unwrap();
        manager
            .handle(Event::TaskFailed {
                task_id: bad.clone(),
                diagnostics: "exit status: 1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            manager.get(&ok).await.unwrap().state,
            TaskState::ExitedWithSuccess
        );
        let failed = manager.get(&bad).await.unwrap();
        assert_eq!(failed.state, TaskState::ExitedWithFailure);
        assert_eq!(failed.diagnostics.as_deref(), Some("exit status: 1"));
        assert!(failed.finished_at.is_some());

        // terminal states stick
        manager
            .handle(Event::TaskFinished {
                task_id: bad.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            manager.get(&bad).await.unwrap().state,
            TaskState::ExitedWithFailure
        );

        tokio::time::timeout(Duration::from_secs(1), manager.wait_all())
            .await
            .unwrap();
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_wait_all_wakes_on_completion() {
        let (manager, mut dispatcher, _added) = create_test_manager().await;
        let manager = Arc::new(manager);
        let id = manager.create_task("app1", "kmeans").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        manager
            .handle(Event::TaskFinished { task_id: id })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        dispatcher.stop().await;
    }
}
