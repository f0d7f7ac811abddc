//! Interpreter and host error types.

use crate::persistence::PersistenceError;
use crate::queue::QueueError;
use harel_model::{EventError, ValidationErrors};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the interpreter and the host.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("invalid document: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("evaluator failure: {0}")]
    Evaluator(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("unhandled error event '{event}': {message}")]
    UnhandledError { event: String, message: String },

    #[error("platform error: {0}")]
    Platform(String),

    #[error("cannot restore session: {0}")]
    Restore(String),

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("session limit reached ({max})")]
    SessionLimit { max: usize },

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InterpreterError {
    /// Returns whether the error stopped (or must stop) a session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InterpreterError::Evaluator(_)
                | InterpreterError::Persistence(_)
                | InterpreterError::UnhandledError { .. }
                | InterpreterError::Platform(_)
                | InterpreterError::Restore(_)
        )
    }

    /// Returns an error code suitable for host responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            InterpreterError::Validation(_) => "INVALID_DOCUMENT",
            InterpreterError::Evaluator(_) => "EVALUATOR_FAILURE",
            InterpreterError::Persistence(_) => "PERSISTENCE_ERROR",
            InterpreterError::UnhandledError { .. } => "UNHANDLED_ERROR",
            InterpreterError::Platform(_) => "PLATFORM_ERROR",
            InterpreterError::Restore(_) => "RESTORE_FAILED",
            InterpreterError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            InterpreterError::SessionExists { .. } => "SESSION_EXISTS",
            InterpreterError::SessionLimit { .. } => "SESSION_LIMIT",
            InterpreterError::Queue(QueueError::Full { .. }) => "QUEUE_FULL",
            InterpreterError::Queue(QueueError::Closed) => "SESSION_CLOSED",
            InterpreterError::Queue(QueueError::InvalidEvent(_)) => "BAD_REQUEST",
            InterpreterError::InvalidEvent(_) => "BAD_REQUEST",
            InterpreterError::Json(_) => "BAD_REQUEST",
        }
    }
}

/// Cloneable form of a session failure, handed out by `result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct SessionFault {
    pub kind: String,
    pub message: String,
}

impl SessionFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&InterpreterError> for SessionFault {
    fn from(err: &InterpreterError) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}
