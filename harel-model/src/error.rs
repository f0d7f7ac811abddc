//! Model error types.

use std::fmt;
use thiserror::Error;

/// A single problem found while building an interpreter model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    /// Element path, e.g. `scxml/state[idle]/transition[0]`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every validation problem of a document.
///
/// The builder never stops at the first problem, so tooling can report the
/// whole list at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if any error was reported for a path containing `fragment`.
    pub fn mentions(&self, fragment: &str) -> bool {
        self.0
            .iter()
            .any(|e| e.path.contains(fragment) || e.message.contains(fragment))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

/// Errors raised by evaluators at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    /// The expression failed; the interpreter raises `error.execution`.
    #[error("execution error: {0}")]
    Execution(String),

    /// The evaluator itself is broken; fatal to the session.
    #[error("evaluator infrastructure failure: {0}")]
    Infrastructure(String),
}

impl EvaluationError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Returns whether this error must stop the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvaluationError::Infrastructure(_))
    }
}

/// Invalid event names or descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("invalid event name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid event descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("invalid delay '{0}'")]
    InvalidDelay(String),
}
