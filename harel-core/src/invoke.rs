//! Invoke controller: tracks the services a session has started.

use crate::communication::{CommunicationError, ExternalCommunication, InvokeData};
use harel_model::Event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// An active invocation, as persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRecord {
    pub invoke_id: String,
    /// Owning state.
    pub state_id: String,
    /// Position of the `<invoke>` within its state.
    pub position: usize,
    pub autoforward: bool,
}

/// Invocations bound to their owning states. Owned by the run loop.
#[derive(Debug)]
pub struct InvokeController {
    communication: Arc<dyn ExternalCommunication>,
    active: Vec<InvokeRecord>,
}

impl InvokeController {
    pub fn new(communication: Arc<dyn ExternalCommunication>) -> Self {
        Self {
            communication,
            active: Vec::new(),
        }
    }

    pub async fn start(
        &mut self,
        record: InvokeRecord,
        data: InvokeData,
    ) -> Result<(), CommunicationError> {
        let invoke_id = record.invoke_id.clone();
        self.communication.start_invoke(data).await?;
        debug!("Started invoke {} in state {}", invoke_id, record.state_id);
        self.active.push(record);
        Ok(())
    }

    /// Cancels every invocation owned by `state_id`. Services that already
    /// finished are dropped without a cancel call. Failures are reported per
    /// invoke id.
    pub async fn cancel_state(
        &mut self,
        state_id: &str,
    ) -> Vec<(String, CommunicationError)> {
        let (owned, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|r| r.state_id == state_id);
        self.active = rest;

        let mut failures = Vec::new();
        for record in owned {
            if !self.communication.is_invoke_active(&record.invoke_id).await {
                debug!("Invoke {} already finished", record.invoke_id);
                continue;
            }
            debug!("Cancelling invoke {}", record.invoke_id);
            if let Err(e) = self.communication.cancel_invoke(&record.invoke_id).await {
                failures.push((record.invoke_id, e));
            }
        }
        failures
    }

    /// Marks an invocation completed after `done.invoke.<id>`.
    pub fn complete(&mut self, invoke_id: &str) -> Option<InvokeRecord> {
        let pos = self.active.iter().position(|r| r.invoke_id == invoke_id)?;
        Some(self.active.remove(pos))
    }

    pub fn get(&self, invoke_id: &str) -> Option<&InvokeRecord> {
        self.active.iter().find(|r| r.invoke_id == invoke_id)
    }

    pub fn is_active(&self, invoke_id: &str) -> bool {
        self.get(invoke_id).is_some()
    }

    /// Forwards an external event to every active autoforward invocation.
    pub async fn autoforward(&self, event: &Event) -> Vec<(String, CommunicationError)> {
        let mut failures = Vec::new();
        for record in self.active.iter().filter(|r| r.autoforward) {
            if let Err(e) = self
                .communication
                .forward_event(event, &record.invoke_id)
                .await
            {
                warn!("Autoforward to invoke {} failed: {}", record.invoke_id, e);
                failures.push((record.invoke_id.clone(), e));
            }
        }
        failures
    }

    pub fn records(&self) -> Vec<InvokeRecord> {
        self.active.clone()
    }

    pub fn restore(&mut self, records: Vec<InvokeRecord>) {
        self.active = records;
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Best-effort cancellation of everything still running.
    pub async fn cancel_all(&mut self) {
        for record in std::mem::take(&mut self.active) {
            if let Err(e) = self.communication.cancel_invoke(&record.invoke_id).await {
                warn!("Failed to cancel invoke {}: {}", record.invoke_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{EventSender, SendStatus};
    use crate::queue::ExternalQueue;
    use async_trait::async_trait;
    use harel_model::OutgoingEvent;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashSet;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        running: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl ExternalCommunication for Recorder {
        async fn try_send_event(
            &self,
            _event: &OutgoingEvent,
        ) -> Result<SendStatus, CommunicationError> {
            Ok(SendStatus::Sent)
        }

        async fn cancel_event(&self, _send_id: &str) -> Result<(), CommunicationError> {
            Ok(())
        }

        async fn start_invoke(&self, data: InvokeData) -> Result<(), CommunicationError> {
            self.calls.lock().push(format!("start {}", data.invoke_id));
            self.running.lock().insert(data.invoke_id);
            Ok(())
        }

        async fn cancel_invoke(&self, invoke_id: &str) -> Result<(), CommunicationError> {
            self.calls.lock().push(format!("cancel {}", invoke_id));
            self.running.lock().remove(invoke_id);
            Ok(())
        }

        async fn is_invoke_active(&self, invoke_id: &str) -> bool {
            self.running.lock().contains(invoke_id)
        }

        async fn forward_event(
            &self,
            event: &Event,
            invoke_id: &str,
        ) -> Result<(), CommunicationError> {
            self.calls
                .lock()
                .push(format!("forward {} {}", event.name, invoke_id));
            Ok(())
        }
    }

    fn record(id: &str, state: &str, autoforward: bool) -> InvokeRecord {
        InvokeRecord {
            invoke_id: id.to_string(),
            state_id: state.to_string(),
            position: 0,
            autoforward,
        }
    }

    fn data(id: &str) -> InvokeData {
        InvokeData {
            invoke_id: id.to_string(),
            state_id: "s".to_string(),
            invoke_type: "mock".to_string(),
            source: None,
            data: Value::Null,
            autoforward: false,
            sender: EventSender::new("session", Arc::new(ExternalQueue::unbounded())),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let comm = Arc::new(Recorder::default());
        let mut controller = InvokeController::new(comm.clone());

        controller.start(record("a", "s1", true), data("a")).await.unwrap();
        controller.start(record("b", "s1", false), data("b")).await.unwrap();
        controller.start(record("c", "s2", false), data("c")).await.unwrap();
        assert_eq!(controller.len(), 3);

        controller.autoforward(&Event::external("tick").unwrap()).await;

        let failures = controller.cancel_state("s1").await;
        assert!(failures.is_empty());
        assert!(!controller.is_active("a"));
        assert!(controller.is_active("c"));

        assert!(controller.complete("c").is_some());
        // Cancelling a completed invoke is a no-op.
        assert!(controller.cancel_state("s2").await.is_empty());

        assert_eq!(
            *comm.calls.lock(),
            vec![
                "start a",
                "start b",
                "start c",
                "forward tick a",
                "cancel a",
                "cancel b",
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_records() {
        let mut controller = InvokeController::new(Arc::new(Recorder::default()));
        controller.restore(vec![record("x", "s", true)]);
        assert!(controller.is_active("x"));
        assert_eq!(controller.records().len(), 1);
        controller.cancel_all().await;
        assert!(controller.is_empty());
    }

    #[tokio::test]
    async fn test_finished_service_is_not_cancelled() {
        let comm = Arc::new(Recorder::default());
        let mut controller = InvokeController::new(comm.clone());
        controller.start(record("a", "s1", false), data("a")).await.unwrap();
        controller.start(record("b", "s1", false), data("b")).await.unwrap();

        // The service behind `a` stopped on its own.
        comm.running.lock().remove("a");

        assert!(controller.cancel_state("s1").await.is_empty());
        assert!(controller.is_empty());
        assert_eq!(*comm.calls.lock(), vec!["start a", "start b", "cancel b"]);
    }
}
