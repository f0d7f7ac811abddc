mod common;

use common::{event, model, traced};
use harel::{Interpreter, InterpreterOptions, SessionOutcome};
use serde_json::json;

#[tokio::test]
async fn test_final_state_done_data_is_session_result() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "final", "id": "done", "done_data": {"content": {"expr": "22"}}}
        ]
    }));

    let (interpreter, _handle) = Interpreter::new(model, "s1", InterpreterOptions::default());
    let outcome = interpreter.run().await.unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(json!(22)));
}

#[tokio::test]
async fn test_parallel_done_only_after_all_regions() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "parallel", "id": "p", "states": [
                {"kind": "state", "id": "r1", "states": [
                    {"kind": "state", "id": "r1a", "transitions": [{"event": "e1", "target": "r1f"}]},
                    {"kind": "final", "id": "r1f"}
                ]},
                {"kind": "state", "id": "r2", "states": [
                    {"kind": "state", "id": "r2a", "transitions": [{"event": "e2", "target": "r2f"}]},
                    {"kind": "final", "id": "r2f"}
                ]}
            ], "transitions": [{"event": "done.state.p", "target": "end"}]},
            {"kind": "final", "id": "end", "done_data": {"content": {"expr": "'both'"}}}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    handle.send(event("e1")).unwrap();
    handle.send(event("e2")).unwrap();

    let outcome = interpreter.run().await.unwrap();
    assert_eq!(outcome, SessionOutcome::Completed(json!("both")));
    assert_eq!(
        trace.events(),
        vec!["e1", "done.state.r1", "e2", "done.state.r2", "done.state.p"]
    );
}

#[tokio::test]
async fn test_zero_delay_send_with_eventless_transition_enters_once() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "A",
             "on_entry": [{"action": "send", "event": "go", "delay": "0ms"}],
             "transitions": [
                {"event": "go", "target": "B"},
                {"target": "B"}
             ]},
            {"kind": "state", "id": "B", "transitions": [{"event": "go", "target": "end"}]},
            {"kind": "final", "id": "end"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, _handle) = Interpreter::new(model, "s1", options);
    let outcome = interpreter.run().await.unwrap();

    assert_eq!(outcome, SessionOutcome::Completed(json!(null)));
    assert_eq!(trace.count("enter B"), 1);
    assert_eq!(trace.count("enter A"), 1);
}

#[tokio::test]
async fn test_document_order_across_parallel_regions() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "parallel", "id": "p", "states": [
                {"kind": "state", "id": "r1", "states": [
                    {"kind": "state", "id": "a1", "transitions": [
                        {"event": "go", "target": "a2", "actions": [
                            {"action": "log", "label": "t", "expr": "1"}
                        ]}
                    ]},
                    {"kind": "state", "id": "a2", "transitions": [{"event": "leave", "target": "out"}]}
                ]},
                {"kind": "state", "id": "r2", "states": [
                    {"kind": "state", "id": "b1", "transitions": [
                        {"event": "go", "target": "b2", "actions": [
                            {"action": "log", "label": "t", "expr": "2"}
                        ]}
                    ]},
                    {"kind": "state", "id": "b2", "transitions": [{"event": "leave", "target": "b1"}]}
                ]}
            ]},
            {"kind": "final", "id": "out"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    handle.send(event("go")).unwrap();
    handle.send(event("leave")).unwrap();
    interpreter.run().await.unwrap();

    assert_eq!(
        trace.entries(),
        vec![
            "enter p", "enter r1", "enter a1", "enter r2", "enter b1",
            // both regions fire; exits in reverse document order
            "exit b1", "exit a1", "log t=1", "log t=2", "enter a2", "enter b2",
            // a2 -> out preempts the later b2 -> b1
            "exit b2", "exit r2", "exit a2", "exit r1", "exit p", "enter out",
            "exit out",
        ]
    );
}

#[tokio::test]
async fn test_descendant_transition_wins_over_ancestor() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "s", "transitions": [{"event": "e", "target": "x"}], "states": [
                {"kind": "state", "id": "s1", "transitions": [{"event": "e", "target": "s2"}]},
                {"kind": "state", "id": "s2"}
            ]},
            {"kind": "final", "id": "x"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    handle.send(event("e")).unwrap();
    handle.send(event("e")).unwrap();
    interpreter.run().await.unwrap();

    assert_eq!(
        trace.entries(),
        vec![
            "enter s", "enter s1",
            "exit s1", "enter s2",
            "exit s2", "exit s", "enter x",
            "exit x",
        ]
    );
}

#[tokio::test]
async fn test_internal_transition_keeps_source_active() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "s", "initial": "s1", "transitions": [
                {"event": "next", "type": "internal", "target": "s2"},
                {"event": "finish", "target": "end"}
            ], "states": [
                {"kind": "state", "id": "s1"},
                {"kind": "state", "id": "s2"}
            ]},
            {"kind": "final", "id": "end"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    handle.send(event("next")).unwrap();
    handle.send(event("finish")).unwrap();
    interpreter.run().await.unwrap();

    assert_eq!(trace.count("enter s"), 1);
    assert_eq!(trace.after("enter s1", 0, 2), vec!["exit s1", "enter s2"]);
}

#[tokio::test]
async fn test_history_deep_and_shallow() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "work", "initial": "w1", "states": [
                {"kind": "history", "id": "hd", "type": "deep", "transition": {"target": "w1"}},
                {"kind": "history", "id": "hs", "type": "shallow", "transition": {"target": "w1"}},
                {"kind": "state", "id": "w1", "transitions": [{"event": "next", "target": "w2"}]},
                {"kind": "state", "id": "w2", "states": [
                    {"kind": "state", "id": "w2a", "transitions": [{"event": "next", "target": "w2b"}]},
                    {"kind": "state", "id": "w2b"}
                ]}
            ], "transitions": [{"event": "pause", "target": "paused"}]},
            {"kind": "state", "id": "paused", "transitions": [
                {"event": "resume_deep", "target": "hd"},
                {"event": "resume_shallow", "target": "hs"},
                {"event": "finish", "target": "end"}
            ]},
            {"kind": "final", "id": "end"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    for name in [
        "next",
        "next",
        "pause",
        "resume_deep",
        "pause",
        "resume_shallow",
        "pause",
        "finish",
    ] {
        handle.send(event(name)).unwrap();
    }
    interpreter.run().await.unwrap();

    assert_eq!(
        trace.after("exit paused", 0, 3),
        vec!["enter work", "enter w2", "enter w2b"]
    );
    assert_eq!(
        trace.after("exit paused", 1, 3),
        vec!["enter work", "enter w2", "enter w2a"]
    );
}

#[tokio::test]
async fn test_history_default_transition_before_first_exit() {
    common::init();
    let model = model(json!({
        "states": [
            {"kind": "state", "id": "idle", "transitions": [{"event": "start", "target": "h"}]},
            {"kind": "state", "id": "work", "states": [
                {"kind": "history", "id": "h", "transition": {"target": "w2", "actions": [
                    {"action": "log", "label": "default", "expr": "true"}
                ]}},
                {"kind": "state", "id": "w1"},
                {"kind": "state", "id": "w2", "transitions": [{"event": "finish", "target": "end"}]}
            ]},
            {"kind": "final", "id": "end"}
        ]
    }));

    let (trace, options) = traced();
    let (interpreter, handle) = Interpreter::new(model, "s1", options);
    handle.send(event("start")).unwrap();
    handle.send(event("finish")).unwrap();
    interpreter.run().await.unwrap();

    assert_eq!(
        trace.after("exit idle", 0, 3),
        vec!["enter work", "log default=true", "enter w2"]
    );
}
