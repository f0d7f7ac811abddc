//! # harel-core
//!
//! Statechart interpreter for harel.
//!
//! This crate provides:
//! - The session run loop (microsteps, macrosteps, history, done events)
//! - Internal and external event queues and the delayed-send scheduler
//! - The external communication and invoke contracts
//! - Checkpointing through persistence contexts
//! - A host that runs sessions as tokio tasks

pub mod cancel;
pub mod communication;
pub mod config;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod invoke;
pub mod logger;
pub mod persistence;
pub mod queue;
pub mod scheduler;

pub use cancel::{CancelSignal, CancelSource};
pub use communication::{
    CommunicationError, EventSender, ExternalCommunication, InvokeData, LocalCommunication,
    SendStatus,
};
pub use config::{
    BackpressurePolicy, Config, ConfigError, HostConfig, InterpreterConfig, PersistenceLevel,
    UnhandledErrorBehavior,
};
pub use error::{InterpreterError, SessionFault};
pub use host::StateChartHost;
pub use interpreter::{
    Interpreter, InterpreterOptions, SessionHandle, SessionOutcome, SessionStatus, StopReason,
};
pub use invoke::{InvokeController, InvokeRecord};
pub use logger::{InterpreterLogger, NoopLogger, TracingLogger};
pub use persistence::{
    PersistenceContext, PersistenceError, PersistenceProvider, SessionCheckpoint,
};
pub use queue::{ExternalQueue, InternalQueue, QueueError};
pub use scheduler::{DelayedSendScheduler, ScheduledSend};
