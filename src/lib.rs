//! harel - an execution engine for hierarchical, parallel statecharts.
//!
//! The workspace is split into three crates, re-exported here:
//!
//! - [`model`]: statechart documents, events, data models and the builder
//!   that resolves a document into an immutable interpreter model
//! - [`engine`]: the interpreter run loop, queues, scheduler, invoke lifecycle
//!   and the session host
//! - [`storage`]: in-memory and file-backed persistence contexts
//!
//! ```no_run
//! use harel::{Config, Document, StateChartHost};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let document = Document::from_json(&serde_json::json!({
//!     "states": [{"kind": "final", "id": "done", "done_data": {"content": {"expr": "22"}}}]
//! }))?;
//! let host = StateChartHost::new(Config::load()?);
//! let handle = host.start(&document, None, Default::default())?;
//! let result = host.result(handle.session_id()).await?;
//! assert_eq!(result, serde_json::json!(22));
//! # Ok(())
//! # }
//! ```

pub use harel_core as engine;
pub use harel_model as model;
pub use harel_storage as storage;

pub use harel_core::{
    Config, InterpreterError, Interpreter, InterpreterOptions, SessionFault, SessionHandle,
    SessionOutcome, SessionStatus, StateChartHost, StopReason,
};
pub use harel_model::{build, Document, Event, InterpreterModel, ValidationErrors};
pub use harel_storage::{MemoryStore, SnapshotStore, StorageError};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
