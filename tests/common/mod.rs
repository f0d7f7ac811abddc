#![allow(dead_code)]

use harel::engine::InterpreterLogger;
use harel::model::{build, DataModelRegistry, Document, Event, InterpreterModel};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub fn init() {
    harel::init_tracing("warn");
}

pub fn document(value: Value) -> Document {
    Document::from_json(&value).unwrap()
}

pub fn model(value: Value) -> Arc<InterpreterModel> {
    Arc::new(build(&document(value), &DataModelRegistry::default()).unwrap())
}

pub fn event(name: &str) -> Event {
    Event::external(name).unwrap()
}

/// Records entries, exits, `<log>` output and processed events in order.
#[derive(Debug, Default)]
pub struct Trace {
    pub entries: Mutex<Vec<String>>,
    pub events: Mutex<Vec<String>>,
}

impl Trace {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Entries that directly follow the `n`th occurrence of `marker`.
    pub fn after(&self, marker: &str, n: usize, len: usize) -> Vec<String> {
        let entries = self.entries();
        let position = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_str() == marker)
            .nth(n)
            .map(|(i, _)| i + 1)
            .unwrap_or(entries.len());
        entries.into_iter().skip(position).take(len).collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.as_str() == entry).count()
    }
}

impl InterpreterLogger for Trace {
    fn state_entered(&self, _session_id: &str, state_id: &str) {
        self.entries.lock().push(format!("enter {}", state_id));
    }

    fn state_exited(&self, _session_id: &str, state_id: &str) {
        self.entries.lock().push(format!("exit {}", state_id));
    }

    fn event_processed(&self, _session_id: &str, event: &Event) {
        self.events.lock().push(event.name.as_str().to_string());
    }

    fn log(&self, _session_id: &str, label: Option<&str>, value: &Value) {
        self.entries
            .lock()
            .push(format!("log {}={}", label.unwrap_or(""), value));
    }
}

/// Polls `check` until it holds, panicking after about two seconds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn traced() -> (Arc<Trace>, harel::InterpreterOptions) {
    let trace = Arc::new(Trace::default());
    let options = harel::InterpreterOptions::default().with_logger(trace.clone());
    (trace, options)
}
