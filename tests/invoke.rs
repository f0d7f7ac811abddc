mod common;

use async_trait::async_trait;
use common::{event, model};
use harel::engine::{
    CommunicationError, ExternalCommunication, InvokeData, LocalCommunication, SendStatus,
};
use harel::model::{Event, OutgoingEvent};
use harel::{Interpreter, InterpreterOptions, SessionOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Accepts invokes of type `worker` and remembers everything done to them.
#[derive(Debug, Default)]
struct WorkerPool {
    started: Mutex<HashMap<String, InvokeData>>,
    forwarded: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<String>>,
}

impl WorkerPool {
    fn invoke(&self, invoke_id: &str) -> Option<InvokeData> {
        self.started.lock().get(invoke_id).cloned()
    }
}

#[async_trait]
impl ExternalCommunication for WorkerPool {
    async fn try_send_event(
        &self,
        event: &OutgoingEvent,
    ) -> Result<SendStatus, CommunicationError> {
        LocalCommunication.try_send_event(event).await
    }

    async fn cancel_event(&self, send_id: &str) -> Result<(), CommunicationError> {
        LocalCommunication.cancel_event(send_id).await
    }

    async fn start_invoke(&self, data: InvokeData) -> Result<(), CommunicationError> {
        if data.invoke_type != "worker" {
            return Err(CommunicationError::UnsupportedType(data.invoke_type));
        }
        self.started.lock().insert(data.invoke_id.clone(), data);
        Ok(())
    }

    async fn cancel_invoke(&self, invoke_id: &str) -> Result<(), CommunicationError> {
        self.cancelled.lock().push(invoke_id.to_string());
        self.started.lock().remove(invoke_id);
        Ok(())
    }

    async fn is_invoke_active(&self, invoke_id: &str) -> bool {
        self.started.lock().contains_key(invoke_id)
    }

    async fn forward_event(&self, event: &Event, invoke_id: &str) -> Result<(), CommunicationError> {
        self.forwarded
            .lock()
            .push((invoke_id.to_string(), event.name.as_str().to_string()));
        Ok(())
    }
}

fn worker_document(autoforward: bool) -> Value {
    json!({
        "data": [{"id": "seen", "expr": "0"}, {"id": "last", "expr": "''"}],
        "states": [
            {"kind": "state", "id": "waiting",
             "invoke": [{
                "id": "job",
                "type": "worker",
                "autoforward": autoforward,
                "params": [{"name": "size", "expr": "3"}],
                "finalize": [{"action": "assign", "location": "last", "expr": "_event.name"}]
             }],
             "transitions": [
                {"event": "progress", "actions": [
                    {"action": "assign", "location": "seen", "expr": "_event.data.value"}
                ]},
                {"event": "done.invoke.job", "target": "end"},
                {"event": "abort", "target": "aborted"}
             ]},
            {"kind": "final", "id": "end", "done_data": {"params": [
                {"name": "seen", "expr": "seen"},
                {"name": "last", "expr": "last"}
            ]}},
            {"kind": "final", "id": "aborted"}
        ]
    })
}

#[tokio::test]
async fn test_invoke_finalize_and_done() {
    common::init();
    let pool = Arc::new(WorkerPool::default());
    let options = InterpreterOptions::default().with_communication(pool.clone());
    let (interpreter, handle) = Interpreter::new(model(worker_document(true)), "s1", options);
    let task = tokio::spawn(interpreter.run());

    handle.settled().await;
    let invoke = pool.invoke("job").expect("invoke started");
    assert_eq!(invoke.state_id, "waiting");
    assert_eq!(invoke.data, json!({"size": 3}));
    assert!(invoke.autoforward);

    handle.send(event("ping")).unwrap();
    invoke
        .sender
        .send(event("progress").with_data(json!({"value": 5})))
        .unwrap();
    invoke.sender.done(json!({"ok": true})).unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        SessionOutcome::Completed(json!({"seen": 5, "last": "done.invoke.job"}))
    );

    let forwarded = pool.forwarded.lock().clone();
    assert!(forwarded.contains(&("job".to_string(), "ping".to_string())));
    assert!(pool.cancelled.lock().is_empty());
}

#[tokio::test]
async fn test_leaving_state_cancels_invoke_and_drops_its_events() {
    common::init();
    let pool = Arc::new(WorkerPool::default());
    let options = InterpreterOptions::default().with_communication(pool.clone());
    let (interpreter, handle) = Interpreter::new(model(worker_document(false)), "s1", options);
    let task = tokio::spawn(interpreter.run());

    handle.settled().await;
    let invoke = pool.invoke("job").expect("invoke started");

    handle.send(event("ping")).unwrap();
    handle.send(event("abort")).unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(Value::Null));
    assert_eq!(*pool.cancelled.lock(), vec!["job".to_string()]);
    assert!(pool.forwarded.lock().is_empty());

    // The session is gone; late events from the service are refused.
    assert!(invoke.sender.send(event("progress")).is_err());
}

#[tokio::test]
async fn test_failed_invoke_raises_communication_error() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "waiting",
             "invoke": [{"id": "job", "type": "unknown-service"}],
             "transitions": [{"event": "error.communication", "target": "failed"}]},
            {"kind": "final", "id": "failed", "done_data": {"content": {"expr": "_event.name"}}}
        ]
    }));
    let pool = Arc::new(WorkerPool::default());
    let options = InterpreterOptions::default().with_communication(pool);
    let (interpreter, _handle) = Interpreter::new(model, "s1", options);

    let outcome = interpreter.run().await.unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(json!("error.communication")));
}
