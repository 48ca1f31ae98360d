//! Task launcher: runs matched tasks on a bounded pool and reports back

use accelet_core::{AcceletError, AcceletResult, Event, LauncherConfig, TaskRef, TaskState};
use accelet_event::{EventHandler, EventPublisher};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What an execution unit does with its task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Run the work function
    Launch,
    /// Release what the work function left behind
    Cleanup,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::Launch => write!(f, "launch"),
            UnitKind::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// One execution unit: runs a task and publishes its outcome
pub struct CallableTask {
    task: TaskRef,
    kind: UnitKind,
    publisher: EventPublisher,
}

impl CallableTask {
    pub fn new(task: TaskRef, kind: UnitKind, publisher: EventPublisher) -> Self {
        Self {
            task,
            kind,
            publisher,
        }
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Run the unit on the blocking pool. A launch unit then publishes
    /// `TaskFinished` on success or `TaskFailed` with diagnostics otherwise.
    ///
    /// A cleanup unit only logs its outcome. Completion events release the
    /// task's core, and a cleanup may arrive while the launch still holds it.
    pub async fn call(self) -> TaskState {
        let task_id = self.task.task_id().clone();
        let kind = self.kind;
        debug!(task_id = %task_id, kind = %kind, "Running task");

        let task = self.task.clone();
        let joined = tokio::task::spawn_blocking(move || match kind {
            UnitKind::Launch => task.run(),
            UnitKind::Cleanup => task.cleanup(),
        })
        .await;

        let (state, diagnostics) = match joined {
            Ok(state) => (state, self.task.diagnostics()),
            Err(e) if e.is_panic() => (
                TaskState::ExitedWithFailure,
                format!("Task panicked: {}", panic_message(e.into_panic())),
            ),
            Err(e) => (TaskState::Killed, format!("Task was cancelled: {}", e)),
        };

        if kind == UnitKind::Cleanup {
            if state == TaskState::ExitedWithSuccess {
                info!(task_id = %task_id, kind = %kind, "Task finished");
            } else {
                warn!(task_id = %task_id, kind = %kind, state = %state, diagnostics = %diagnostics, "Task failed");
            }
            return state;
        }

        let event = if state == TaskState::ExitedWithSuccess {
            info!(task_id = %task_id, kind = %kind, "Task finished");
            Event::TaskFinished {
                task_id: task_id.clone(),
            }
        } else {
            warn!(task_id = %task_id, kind = %kind, state = %state, diagnostics = %diagnostics, "Task failed");
            Event::TaskFailed {
                task_id: task_id.clone(),
                diagnostics,
            }
        };
        if let Err(e) = self.publisher.publish(event) {
            error!(task_id = %task_id, error = %e, "Failed to report task outcome");
        }

        state
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Hands launch and cleanup units to a bounded worker pool.
///
/// `handle` only enqueues; a dedicated dispatch task moves units into the
/// pool as permits free up, so a saturated pool never blocks event delivery.
pub struct TaskLauncher {
    tx: mpsc::UnboundedSender<CallableTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<CallableTask>>>,
    publisher: EventPublisher,
    threads: usize,
    shutdown: CancellationToken,
    launcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskLauncher {
    pub fn new(config: &LauncherConfig, publisher: EventPublisher) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            publisher,
            threads: config.threads.max(1),
            shutdown: CancellationToken::new(),
            launcher: Mutex::new(None),
        }
    }

    /// Queue a unit for execution
    pub fn submit(&self, unit: CallableTask) -> AcceletResult<()> {
        let task_id = unit.task().task_id().clone();
        self.tx
            .send(unit)
            .map_err(|_| AcceletError::Launcher(format!("Launcher stopped, dropping {}", task_id)))
    }

    /// Spawn the dispatch task
    pub async fn start(&self) -> AcceletResult<()> {
        let mut launcher = self.launcher.lock().await;
        if launcher.is_some() {
            warn!("Task launcher already started");
            return Ok(());
        }
        let rx = self.rx.lock().await.take().ok_or_else(|| {
            AcceletError::Launcher("Task launcher cannot be restarted after stop".to_string())
        })?;

        let semaphore = Arc::new(Semaphore::new(self.threads));
        *launcher = Some(tokio::spawn(run_launcher(
            rx,
            semaphore,
            self.shutdown.clone(),
        )));

        info!(threads = self.threads, "Task launcher started");
        Ok(())
    }

    /// Interrupt the dispatch task and abort units still in the pool
    pub async fn stop(&self) {
        let Some(handle) = self.launcher.lock().await.take() else {
            warn!("Task launcher is not running");
            return;
        };

        self.shutdown.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Launcher task ended abnormally");
        }
        info!("Task launcher stopped");
    }
}

async fn run_launcher(
    mut rx: mpsc::UnboundedReceiver<CallableTask>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(finished) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = finished {
                    warn!(error = %e, "Execution unit ended abnormally");
                }
            }
            unit = rx.recv() => {
                let Some(unit) = unit else {
                    break;
                };
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                running.spawn(async move {
                    let _permit = permit;
                    unit.call().await
                });
            }
        }
    }

    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 || !running.is_empty() {
        warn!(
            queued = dropped,
            in_flight = running.len(),
            "Abandoning units at shutdown"
        );
    }
    running.abort_all();
}

#[async_trait]
impl EventHandler for TaskLauncher {
    async fn handle(&self, event: Event) -> AcceletResult<()> {
        let (task, kind) = match event {
            Event::LaunchTask { task, allocation } => {
                debug!(
                    task_id = %task.task_id(),
                    card = %allocation.card_id,
                    core = allocation.resource.core_id,
                    "Submitting task"
                );
                (task, UnitKind::Launch)
            }
            Event::CleanupTask { task } => (task, UnitKind::Cleanup),
            other => {
                return Err(AcceletError::Launcher(format!(
                    "Unexpected {} event",
                    other.event_type()
                )));
            }
        };

        self.submit(CallableTask::new(task, kind, self.publisher.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelet_core::{
        AcceleratorResource, Allocation, DispatcherConfig, EventType, Task, TaskId, WorkerType,
    };
    use accelet_event::AsyncDispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Block(Duration),
    }

    struct FakeTask {
        id: TaskId,
        behaviour: Behaviour,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeTask {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                id: TaskId::new("app1", "kmeans", 0),
                behaviour,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Task for FakeTask {
        fn task_id(&self) -> &TaskId {
            &self.id
        }

        fn workload(&self) -> &str {
            &self.id.workload
        }

        fn run(&self) -> TaskState {
            match self.behaviour {
                Behaviour::Succeed => TaskState::ExitedWithSuccess,
                Behaviour::Fail => TaskState::ExitedWithFailure,
                Behaviour::Panic => panic!("device fell off the bus"),
                Behaviour::Block(duration) => {
                    let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(duration);
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    TaskState::ExitedWithSuccess
                }
            }
        }

        fn diagnostics(&self) -> String {
            match self.behaviour {
                Behaviour::Fail => "exit status 3".to_string(),
                _ => String::new(),
            }
        }

        fn cleanup(&self) -> TaskState {
            TaskState::ExitedWithFailure
        }
    }

    struct Outcomes {
        seen: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl EventHandler for Outcomes {
        async fn handle(&self, event: Event) -> AcceletResult<()> {
            let _ = self.seen.send(event);
            Ok(())
        }
    }

    async fn create_test_dispatcher() -> (AsyncDispatcher, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut dispatcher = AsyncDispatcher::new(&DispatcherConfig::default());
        let outcomes = Arc::new(Outcomes { seen: tx });
        dispatcher
            .register(EventType::TaskFinished, outcomes.clone())
            .await;
        dispatcher.register(EventType::TaskFailed, outcomes).await;
        dispatcher.start().unwrap();
        (dispatcher, rx)
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
    async fn test_callable_task_reports_success_and_failure() {
        let (mut dispatcher, mut outcomes) = create_test_dispatcher().await;
        let publisher = dispatcher.event_handler();

        let ok: TaskRef = Arc::new(FakeTask::new(Behaviour::Succeed));
        let state = CallableTask::new(ok.clone(), UnitKind::Launch, publisher.clone())
            .call()
            .await;
        assert_eq!(state, TaskState::ExitedWithSuccess);
        match outcomes.recv().await.unwrap() {
            Event::TaskFinished { task_id } => assert_eq!(&task_id, ok.task_id()),
            other => panic!("unexpected {:?}", other),
        }

        let failing: TaskRef = Arc::new(FakeTask::new(Behaviour::Fail));
        let state = CallableTask::new(failing, UnitKind::Launch, publisher)
            .call()
            .await;
        assert_eq!(state, TaskState::ExitedWithFailure);
        match outcomes.recv().await.unwrap() {
            Event::TaskFailed { diagnostics, .. } => assert_eq!(diagnostics, "exit status 3"),
            other => panic!("unexpected {:?}", other),
        }

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failure() {
        let (mut dispatcher, mut outcomes) = create_test_dispatcher().await;

        let task: TaskRef = Arc::new(FakeTask::new(Behaviour::Panic));
        let state = CallableTask::new(task, UnitKind::Launch, dispatcher.event_handler())
            .call()
            .await;
        assert_eq!(state, TaskState::ExitedWithFailure);
        match outcomes.recv().await.unwrap() {
            Event::TaskFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("device fell off the bus"))
            }
            other => panic!("unexpected {:?}", other),
        }

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_unit_calls_cleanup() {
        let (mut dispatcher, mut outcomes) = create_test_dispatcher().await;
        let publisher = dispatcher.event_handler();

        // run() would succeed, cleanup() fails
        let task: TaskRef = Arc::new(FakeTask::new(Behaviour::Succeed));
        let state = CallableTask::new(task, UnitKind::Cleanup, publisher.clone())
            .call()
            .await;
        assert_eq!(state, TaskState::ExitedWithFailure);

        // cleanup publishes nothing, so the launch outcome is the first event seen
        let launched: TaskRef = Arc::new(FakeTask::new(Behaviour::Succeed));
        CallableTask::new(launched, UnitKind::Launch, publisher)
            .call()
            .await;
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            Event::TaskFinished { .. }
        ));

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_event_does_not_report_completion() {
        let (mut dispatcher, mut outcomes) = create_test_dispatcher().await;
        let launcher = TaskLauncher::new(&LauncherConfig::default(), dispatcher.event_handler());
        launcher.start().await.unwrap();

        let task: TaskRef = Arc::new(FakeTask::new(Behaviour::Succeed));
        launcher.handle(Event::CleanupTask { task }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outcomes.try_recv().is_err());

        launcher.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_is_bounded() {
        let (mut dispatcher, mut outcomes) = create_test_dispatcher().await;
        let launcher = TaskLauncher::new(&LauncherConfig { threads: 2 }, dispatcher.event_handler());
        launcher.start().await.unwrap();

        let template = FakeTask::new(Behaviour::Block(Duration::from_millis(50)));
        for _ in 0..6 {
            let task: TaskRef = Arc::new(FakeTask {
                id: TaskId::new("app1", "kmeans", 0),
                behaviour: Behaviour::Block(Duration::from_millis(50)),
                running: template.running.clone(),
                peak: template.peak.clone(),
            });
            // handle only enqueues and returns at once
            launcher.handle(launch(task)).await.unwrap();
        }
        for _ in 0..6 {
            assert!(matches!(
                outcomes.recv().await.unwrap(),
                Event::TaskFinished { .. }
            ));
        }
        assert!(template.peak.load(Ordering::SeqCst) <= 2);

        launcher.stop().await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dispatcher = AsyncDispatcher::new(&DispatcherConfig::default());
        let launcher = TaskLauncher::new(&LauncherConfig::default(), dispatcher.event_handler());

        launcher.stop().await;
        launcher.start().await.unwrap();
        launcher.start().await.unwrap();
        launcher.stop().await;
        assert!(launcher.start().await.is_err());

        let task: TaskRef = Arc::new(FakeTask::new(Behaviour::Succeed));
        assert!(launcher.handle(launch(task)).await.is_err());
        assert!(launcher
            .handle(Event::TaskFinished {
                task_id: TaskId::new("app1", "kmeans", 0),
            })
            .await
            .is_err());
    }
}
