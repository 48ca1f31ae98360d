//! Asynchronous event dispatcher
//!
//! Events are published into an unbounded FIFO and consumed by a single
//! dispatcher task, so handlers observe events in publication order and
//! never run concurrently with each other.

use accelet_core::{AcceletError, AcceletResult, DispatcherConfig, Event, EventType};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{EventHandler, MultiListenerHandler};

/// Queue depth is logged every time it crosses a multiple of this
const QUEUE_DEPTH_LOG_INTERVAL: usize = 1000;

/// Invoked when an event cannot be dispatched and exit-on-error is set.
///
/// An unrouted event, a handler error and a handler panic all count as
/// dispatch failures.
pub type FailureHook = Arc<dyn Fn(&AcceletError) + Send + Sync>;

/// Handlers registered for one event type
struct Route {
    listeners: Vec<Arc<dyn EventHandler>>,
    handler: Arc<dyn EventHandler>,
}

type Routes = Arc<RwLock<HashMap<EventType, Route>>>;

/// Cheap handle used by components to enqueue events
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Event>,
    depth: Arc<AtomicUsize>,
}

impl EventPublisher {
    /// Enqueue an event. Never blocks.
    ///
    /// Fails only once the dispatcher has stopped and its queue is closed.
    pub fn publish(&self, event: Event) -> AcceletResult<()> {
        let event_type = event.event_type();
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth % QUEUE_DEPTH_LOG_INTERVAL == 0 {
            info!(depth = depth, "Size of event-queue");
        }

        self.tx.send(event).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            AcceletError::Dispatcher(format!(
                "Event queue is closed, dropping {} event",
                event_type
            ))
        })
    }
}

#[async_trait]
impl EventHandler for EventPublisher {
    async fn handle(&self, event: Event) -> AcceletResult<()> {
        self.publish(event)
    }
}

/// Routes events to handlers by event type on a dedicated task
pub struct AsyncDispatcher {
    routes: Routes,
    tx: mpsc::UnboundedSender<Event>,
    rx: Option<mpsc::UnboundedReceiver<Event>>,
    depth: Arc<AtomicUsize>,
    exit_on_error: bool,
    stop_timeout: Duration,
    failure_hook: FailureHook,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl AsyncDispatcher {
    pub fn new(config: &DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            tx,
            rx: Some(rx),
            depth: Arc::new(AtomicUsize::new(0)),
            exit_on_error: config.exit_on_error,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            failure_hook: Arc::new(|_: &AcceletError| std::process::exit(-1)),
            shutdown: CancellationToken::new(),
            worker: None,
        }
    }

    /// Replace the action taken on a fatal dispatch failure
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.failure_hook = hook;
        self
    }

    /// Register a handler for an event type.
    ///
    /// Registering a second handler for the same type fans the event out to
    /// every registered handler, in registration order.
    pub async fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let mut routes = self.routes.write().await;
        match routes.get_mut(&event_type) {
            Some(route) => {
                route.listeners.push(handler);
                route.handler = Arc::new(MultiListenerHandler::new(route.listeners.clone()));
                debug!(
                    event = %event_type,
                    listeners = route.listeners.len(),
                    "Added listener to event type"
                );
            }
            None => {
                debug!(event = %event_type, "Registering handler for event type");
                routes.insert(
                    event_type,
                    Route {
                        listeners: vec![handler.clone()],
                        handler,
                    },
                );
            }
        }
    }

    /// Handle for publishing events onto this dispatcher
    pub fn event_handler(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }

    /// Number of events published but not yet dispatched
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Whether `stop` has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Spawn the dispatcher task
    pub fn start(&mut self) -> AcceletResult<()> {
        if self.worker.is_some() {
            warn!("Dispatcher already started");
            return Ok(());
        }
        let rx = self.rx.take().ok_or_else(|| {
            AcceletError::Dispatcher("Dispatcher cannot be restarted after stop".to_string())
        })?;

        let worker = Worker {
            routes: self.routes.clone(),
            rx,
            depth: self.depth.clone(),
            exit_on_error: self.exit_on_error,
            failure_hook: self.failure_hook.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.worker = Some(tokio::spawn(worker.run()));

        info!("Started event dispatcher");
        Ok(())
    }

    /// Stop the dispatcher, delivering events already queued
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.worker.take() else {
            warn!("Dispatcher is not running");
            return;
        };

        self.shutdown.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Dispatcher task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    remaining = self.queue_depth(),
                    "Dispatcher did not drain in time, aborting"
                );
                handle.abort();
            }
        }
        info!("Stopped event dispatcher");
    }
}

/// State owned by the dispatcher task
struct Worker {
    routes: Routes,
    rx: mpsc::UnboundedReceiver<Event>,
    depth: Arc<AtomicUsize>,
    exit_on_error: bool,
    failure_hook: FailureHook,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }

        // refuse new events, then deliver whatever was already queued
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.dispatch(event).await;
        }
        debug!("Dispatcher loop exited");
    }

    async fn dispatch(&self, event: Event) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        let event_type = event.event_type();
        debug!(event = %event_type, task_id = %event.task_id(), "Dispatching event");

        let handler = self
            .routes
            .read()
            .await
            .get(&event_type)
            .map(|route| route.handler.clone());

        let result = match handler {
            Some(handler) => match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(AcceletError::Dispatcher(format!(
                    "Handler for {} panicked: {}",
                    event_type,
                    panic_message(payload.as_ref())
                ))),
            },
            None => Err(AcceletError::Dispatcher(format!(
                "No handler for event type {}",
                event_type
            ))),
        };

        if let Err(e) = result {
            self.fail(event_type, e);
        }
    }

    fn fail(&self, event_type: EventType, e: AcceletError) {
        error!(event = %event_type, error = %e, "Error in dispatcher loop");
        if self.exit_on_error && !self.shutdown.is_cancelled() {
            error!("Exiting after fatal dispatch error");
            (self.failure_hook)(&e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
