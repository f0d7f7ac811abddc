//! Interpreter logging hooks.

use harel_model::Event;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

/// Observer of interpreter activity. Every hook defaults to a no-op and
/// failures inside hooks must never reach the interpreter.
pub trait InterpreterLogger: fmt::Debug + Send + Sync {
    fn state_entered(&self, _session_id: &str, _state_id: &str) {}

    fn state_exited(&self, _session_id: &str, _state_id: &str) {}

    fn transition(&self, _session_id: &str, _source: &str, _targets: &[String], _event: Option<&str>) {}

    fn event_processed(&self, _session_id: &str, _event: &Event) {}

    /// Output of `<log>`.
    fn log(&self, _session_id: &str, _label: Option<&str>, _value: &Value) {}

    fn error(&self, _session_id: &str, _event: &str, _message: &str) {}
}

/// Emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl InterpreterLogger for TracingLogger {
    fn state_entered(&self, session_id: &str, state_id: &str) {
        debug!("[{}] Entered state {}", session_id, state_id);
    }

    fn state_exited(&self, session_id: &str, state_id: &str) {
        debug!("[{}] Exited state {}", session_id, state_id);
    }

    fn transition(&self, session_id: &str, source: &str, targets: &[String], event: Option<&str>) {
        debug!(
            "[{}] Transition {} -> {:?} on '{}'",
            session_id,
            source,
            targets,
            event.unwrap_or("")
        );
    }

    fn event_processed(&self, session_id: &str, event: &Event) {
        debug!("[{}] Processing event {}", session_id, event.name);
    }

    fn log(&self, session_id: &str, label: Option<&str>, value: &Value) {
        info!("[{}] {}: {}", session_id, label.unwrap_or("log"), value);
    }

    fn error(&self, session_id: &str, event: &str, message: &str) {
        warn!("[{}] Raised {}: {}", session_id, event, message);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl InterpreterLogger for NoopLogger {}
