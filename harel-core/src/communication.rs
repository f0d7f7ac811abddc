//! External communication contract.
//!
//! The interpreter never talks to other sessions or services directly: every
//! `<send>`, `<cancel>` and `<invoke>` goes through an
//! [`ExternalCommunication`] implementation. [`LocalCommunication`] is the
//! default and only knows about the session itself.

use crate::queue::{ExternalQueue, QueueError};
use async_trait::async_trait;
use harel_model::event::SCXML_EVENT_PROCESSOR;
use harel_model::{Event, EventName, EventType, OutgoingEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const INTERNAL_TARGET: &str = "#_internal";

/// Where a sent event goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Delivered by the communication layer.
    Sent,
    /// Back into this session's external queue through the scheduler.
    ToSchedule,
    /// Onto this session's internal queue.
    ToInternalQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommunicationError {
    #[error("unsupported type '{0}'")]
    UnsupportedType(String),

    #[error("unsupported target '{0}'")]
    UnsupportedTarget(String),

    #[error("communication failure: {0}")]
    Failed(String),
}

impl CommunicationError {
    /// Malformed requests raise `error.execution`; delivery failures raise
    /// `error.communication`.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            CommunicationError::UnsupportedType(_) | CommunicationError::UnsupportedTarget(_)
        )
    }
}

/// Handle an invoked service uses to reach its parent session.
#[derive(Clone)]
pub struct EventSender {
    session_id: String,
    invoke_id: Option<String>,
    queue: Arc<ExternalQueue>,
}

impl EventSender {
    pub fn new(session_id: impl Into<String>, queue: Arc<ExternalQueue>) -> Self {
        Self {
            session_id: session_id.into(),
            invoke_id: None,
            queue,
        }
    }

    pub fn for_invoke(&self, invoke_id: impl Into<String>) -> Self {
        Self {
            session_id: self.session_id.clone(),
            invoke_id: Some(invoke_id.into()),
            queue: self.queue.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn invoke_id(&self) -> Option<&str> {
        self.invoke_id.as_deref()
    }

    fn stamp(&self, mut event: Event) -> Event {
        if event.invoke_id.is_none() {
            event.invoke_id = self.invoke_id.clone();
        }
        event
    }

    pub fn send(&self, event: Event) -> Result<(), QueueError> {
        self.queue.try_enqueue(self.stamp(event))
    }

    pub async fn send_async(&self, event: Event) -> Result<(), QueueError> {
        self.queue.enqueue(self.stamp(event)).await
    }

    /// Reports completion of the invocation with `done.invoke.<id>`.
    pub fn done(&self, data: Value) -> Result<(), QueueError> {
        let Some(invoke_id) = &self.invoke_id else {
            return Ok(());
        };
        let name = EventName::parse(&format!("done.invoke.{}", invoke_id))
            .map_err(|e| QueueError::InvalidEvent(e.to_string()))?;
        self.send(Event::new(name, EventType::External).with_data(data))
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("session_id", &self.session_id)
            .field("invoke_id", &self.invoke_id)
            .finish()
    }
}

/// Everything a service needs to start.
#[derive(Debug, Clone)]
pub struct InvokeData {
    pub invoke_id: String,
    pub state_id: String,
    pub invoke_type: String,
    pub source: Option<String>,
    /// Evaluated content, or the namelist/param object.
    pub data: Value,
    pub autoforward: bool,
    pub sender: EventSender,
}

#[async_trait]
pub trait ExternalCommunication: fmt::Debug + Send + Sync {
    async fn try_send_event(&self, event: &OutgoingEvent)
        -> Result<SendStatus, CommunicationError>;

    async fn cancel_event(&self, send_id: &str) -> Result<(), CommunicationError>;

    async fn start_invoke(&self, data: InvokeData) -> Result<(), CommunicationError>;

    async fn cancel_invoke(&self, invoke_id: &str) -> Result<(), CommunicationError>;

    async fn is_invoke_active(&self, invoke_id: &str) -> bool;

    async fn forward_event(&self, event: &Event, invoke_id: &str)
        -> Result<(), CommunicationError>;
}

/// Routes self-targeted sends back to the session and rejects everything
/// else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunication;

impl LocalCommunication {
    fn is_scxml_type(send_type: Option<&str>) -> bool {
        matches!(send_type, None | Some("scxml") | Some(SCXML_EVENT_PROCESSOR))
    }
}

#[async_trait]
impl ExternalCommunication for LocalCommunication {
    async fn try_send_event(
        &self,
        event: &OutgoingEvent,
    ) -> Result<SendStatus, CommunicationError> {
        if !Self::is_scxml_type(event.event_type.as_deref()) {
            return Err(CommunicationError::UnsupportedType(
                event.event_type.clone().unwrap_or_default(),
            ));
        }
        match event.target.as_deref() {
            None => Ok(SendStatus::ToSchedule),
            Some(target) if target == event.origin => Ok(SendStatus::ToSchedule),
            Some(INTERNAL_TARGET) => Ok(SendStatus::ToInternalQueue),
            Some(target) => Err(CommunicationError::UnsupportedTarget(target.to_string())),
        }
    }

    async fn cancel_event(&self, _send_id: &str) -> Result<(), CommunicationError> {
        Ok(())
    }

    async fn start_invoke(&self, data: InvokeData) -> Result<(), CommunicationError> {
        Err(CommunicationError::UnsupportedType(data.invoke_type))
    }

    async fn cancel_invoke(&self, _invoke_id: &str) -> Result<(), CommunicationError> {
        Ok(())
    }

    async fn is_invoke_active(&self, _invoke_id: &str) -> bool {
        false
    }

    async fn forward_event(
        &self,
        _event: &Event,
        invoke_id: &str,
    ) -> Result<(), CommunicationError> {
        Err(CommunicationError::Failed(format!(
            "no invoked service '{}'",
            invoke_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outgoing(target: Option<&str>, event_type: Option<&str>) -> OutgoingEvent {
        OutgoingEvent {
            name: EventName::parse("ping").unwrap(),
            send_id: "send-1".to_string(),
            target: target.map(str::to_string),
            event_type: event_type.map(str::to_string),
            delay: Duration::ZERO,
            data: Value::Null,
            origin: "#_scxml_s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_routing() {
        let comm = LocalCommunication;
        assert_eq!(
            comm.try_send_event(&outgoing(None, None)).await,
            Ok(SendStatus::ToSchedule)
        );
        assert_eq!(
            comm.try_send_event(&outgoing(Some("#_scxml_s1"), Some("scxml"))).await,
            Ok(SendStatus::ToSchedule)
        );
        assert_eq!(
            comm.try_send_event(&outgoing(Some("#_internal"), None)).await,
            Ok(SendStatus::ToInternalQueue)
        );

        let err = comm
            .try_send_event(&outgoing(Some("http://elsewhere"), None))
            .await
            .unwrap_err();
        assert!(err.is_execution());
        let err = comm
            .try_send_event(&outgoing(None, Some("basichttp")))
            .await
            .unwrap_err();
        assert_eq!(err, CommunicationError::UnsupportedType("basichttp".to_string()));
    }

    #[test]
    fn test_event_sender_stamps_invoke_id() {
        let queue = Arc::new(ExternalQueue::unbounded());
        let sender = EventSender::new("s1", queue.clone()).for_invoke("child.1");

        sender.send(Event::external("progress").unwrap()).unwrap();
        sender.done(serde_json::json!({"ok": true})).unwrap();

        let progress = queue.try_dequeue().unwrap();
        assert_eq!(progress.invoke_id.as_deref(), Some("child.1"));
        let done = queue.try_dequeue().unwrap();
        assert_eq!(done.name.as_str(), "done.invoke.child.1");
        assert_eq!(done.data, serde_json::json!({"ok": true}));
    }

    #[test]
    fn test_done_with_malformed_invoke_id() {
        let queue = Arc::new(ExternalQueue::unbounded());
        let sender = EventSender::new("s1", queue.clone()).for_invoke("bad id");

        let err = sender.done(Value::Null).unwrap_err();
        assert!(matches!(err, QueueError::InvalidEvent(_)));
        assert!(!queue.is_closed());
        assert!(queue.is_empty());
    }
}
