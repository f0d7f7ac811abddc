mod common;

use common::{document, event, model};
use harel::engine::{BackpressurePolicy, InterpreterConfig, QueueError, UnhandledErrorBehavior};
use harel::{
    Config, Interpreter, InterpreterError, InterpreterOptions, SessionOutcome, StateChartHost,
    StopReason,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn failing_entry() -> Value {
    json!({
        "states": [
            {"kind": "state", "id": "s", "on_entry": [
                {"action": "assign", "location": "undeclared", "expr": "1"}
            ], "transitions": [{"event": "finish", "target": "end"}]},
            {"kind": "final", "id": "end", "done_data": {"content": {"expr": "'finished'"}}}
        ]
    })
}

fn options(behavior: UnhandledErrorBehavior) -> InterpreterOptions {
    InterpreterOptions::default().with_config(InterpreterConfig {
        unhandled_error: behavior,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_unhandled_error_ignored() {
    common::init();
    let (interpreter, handle) = Interpreter::new(
        model(failing_entry()),
        "s1",
        options(UnhandledErrorBehavior::Ignore),
    );
    handle.send(event("finish")).unwrap();

    let outcome = interpreter.run().await.unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(json!("finished")));
}

#[tokio::test]
async fn test_unhandled_error_destroys_state_machine() {
    common::init();
    let (interpreter, handle) = Interpreter::new(
        model(failing_entry()),
        "s1",
        options(UnhandledErrorBehavior::DestroyStateMachine),
    );
    handle.send(event("finish")).unwrap();

    let outcome = interpreter.run().await.unwrap();
    match outcome {
        SessionOutcome::Stopped(StopReason::Fault(fault)) => {
            assert_eq!(fault.kind, "error.execution");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(handle.status().is_terminal());
}

#[tokio::test]
async fn test_unhandled_error_rethrown() {
    common::init();
    let (interpreter, _handle) = Interpreter::new(
        model(failing_entry()),
        "s1",
        options(UnhandledErrorBehavior::RethrowException),
    );

    let err = interpreter.run().await.unwrap_err();
    assert!(matches!(
        &err,
        InterpreterError::UnhandledError { event, .. } if event == "error.execution"
    ));
    assert_eq!(err.error_code(), "UNHANDLED_ERROR");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_error_event_can_be_handled_by_document() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "s", "on_entry": [
                {"action": "send", "event": "out", "target": "http://elsewhere"}
            ], "transitions": [
                {"event": "error.communication", "target": "failed"},
                {"event": "error.execution", "target": "failed"}
            ]},
            {"kind": "final", "id": "failed", "done_data": {"content": {"expr": "_event.name"}}}
        ]
    }));

    let (interpreter, _handle) = Interpreter::new(
        model,
        "s1",
        options(UnhandledErrorBehavior::RethrowException),
    );
    let outcome = interpreter.run().await.unwrap();
    let SessionOutcome::Completed(Value::String(name)) = outcome else {
        panic!("expected an error event name");
    };
    assert!(name.starts_with("error."));
}

#[tokio::test]
async fn test_invalid_document_reports_every_problem() {
    common::init();
    let host = StateChartHost::new(Config::default());
    let doc = document(json!({
        "datamodel": "null",
        "states": [
            {"kind": "state", "id": "a", "transitions": [
                {"event": "go", "cond": "count > 1", "target": "b"},
                {"event": "go", "target": "missing"}
            ]},
            {"kind": "final", "id": "b"}
        ]
    }));

    let err = host.start(&doc, None, Default::default()).unwrap_err();
    assert_eq!(err.error_code(), "INVALID_DOCUMENT");
    let InterpreterError::Validation(errors) = err else {
        panic!("expected validation errors");
    };
    assert!(errors.len() >= 2);
    assert!(errors.mentions("missing"));
    assert!(host.session_ids().is_empty());
}

#[tokio::test]
async fn test_queue_rejects_when_full() {
    common::init();
    let config = InterpreterConfig {
        queue_capacity: 1,
        backpressure: BackpressurePolicy::Reject,
        ..Default::default()
    };
    let model = model(json!({"states": [{"kind": "state", "id": "idle"}]}));
    let (_interpreter, handle) =
        Interpreter::new(model, "s1", InterpreterOptions::default().with_config(config));

    handle.send(event("a")).unwrap();
    assert_eq!(
        handle.send(event("b")).unwrap_err(),
        QueueError::Full { capacity: 1 }
    );
}

#[tokio::test]
async fn test_queue_blocks_until_room() {
    common::init();
    let config = InterpreterConfig {
        queue_capacity: 1,
        backpressure: BackpressurePolicy::Block,
        ..Default::default()
    };
    let model = model(json!({
        "data": [{"id": "count", "expr": "0"}],
        "states": [
            {"kind": "state", "id": "idle", "transitions": [
                {"event": "tick", "cond": "count == 1", "target": "end"},
                {"event": "tick", "actions": [
                    {"action": "assign", "location": "count", "expr": "count + 1"}
                ]}
            ]},
            {"kind": "final", "id": "end", "done_data": {"content": {"expr": "count"}}}
        ]
    }));
    let (interpreter, handle) =
        Interpreter::new(model, "s1", InterpreterOptions::default().with_config(config));

    handle.send(event("tick")).unwrap();
    let task = tokio::spawn(interpreter.run());
    handle.send_async(event("tick")).await.unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(json!(1)));
}

#[tokio::test]
async fn test_host_session_limit_and_unknown_session() {
    common::init();
    let mut config = Config::default();
    config.host.max_sessions = 1;
    let host = Arc::new(StateChartHost::new(config));
    let doc = document(json!({"states": [{"kind": "state", "id": "idle"}]}));

    host.start(&doc, Some("one".to_string()), Default::default())
        .unwrap();
    let err = host
        .start(&doc, Some("two".to_string()), Default::default())
        .unwrap_err();
    assert_eq!(err.error_code(), "SESSION_LIMIT");

    let err = host.send("nope", event("x")).unwrap_err();
    assert_eq!(err.error_code(), "SESSION_NOT_FOUND");

    host.stop("one").unwrap();
    let fault = host.result("one").await.unwrap_err();
    assert_eq!(fault.kind, "CANCELLED");
    host.shutdown().await;
}
