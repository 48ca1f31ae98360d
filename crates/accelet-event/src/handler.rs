//! Event handler trait and fan-out composition

use accelet_core::{AcceletResult, Event};
use async_trait::async_trait;
use std::sync::Arc;

/// Something that reacts to dispatched events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. An `Err` is reported to the dispatcher as a dispatch failure.
    async fn handle(&self, event: Event) -> AcceletResult<()>;
}

/// Invokes several handlers, in registration order, for every event
pub struct MultiListenerHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MultiListenerHandler {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }

    /// Number of composed handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl EventHandler for MultiListenerHandler {
    async fn handle(&self, event: Event) -> AcceletResult<()> {
        for handler in &self.handlers {
            handler.handle(event.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelet_core::{AcceletError, TaskId};
    use tokio::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: Event) -> AcceletResult<()> {
            self.log
                .lock()
                .await
                .push(format!("{}:{}", self.name, event.event_type()));
            if self.fail {
                return Err(AcceletError::Internal(self.name.to_string()));
            }
            Ok(())
        }
    }

    fn finished() -> Event {
        Event::TaskFinished {
            task_id: TaskId::new("app1", "kmeans", 0),
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let multi = MultiListenerHandler::new(vec![
            Arc::new(Recorder {
                name: "first",
                log: log.clone(),
                fail: false,
            }),
            Arc::new(Recorder {
                name: "second",
                log: log.clone(),
                fail: false,
            }),
        ]);
        assert_eq!(multi.len(), 2);

        multi.handle(finished()).await.unwrap();
        assert_eq!(
            *log.lock().await,
            vec!["first:TASK_FINISHED", "second:TASK_FINISHED"]
        );
    }

    #[tokio::test]
    async fn test_fan_out_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let multi = MultiListenerHandler::new(vec![
            Arc::new(Recorder {
                name: "broken",
                log: log.clone(),
                fail: true,
            }),
            Arc::new(Recorder {
                name: "never",
                log: log.clone(),
                fail: false,
            }),
        ]);

        assert!(multi.handle(finished()).await.is_err());
        assert_eq!(log.lock().await.len(), 1);
    }
}
