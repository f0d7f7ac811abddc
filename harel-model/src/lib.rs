//! # harel-model
//!
//! Statechart model for harel.
//!
//! This crate provides:
//! - The statechart document (entity model), deserializable from JSON
//! - Events and event descriptors
//! - The session data model and evaluator contracts
//! - The `null` and `json` data-model handlers
//! - The interpreter model builder

pub mod builder;
pub mod datamodel;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod expr;
pub mod handler;
pub mod model;

pub use builder::{build, InterpreterModelBuilder};
pub use datamodel::{DataModel, ExecutionScope, Path, StateQuery};
pub use document::Document;
pub use error::{EvaluationError, EventError, ValidationError, ValidationErrors};
pub use evaluator::{
    ConditionEvaluator, DataModelHandler, DataModelRegistry, LocationEvaluator, ScriptEvaluator,
    ValueEvaluator,
};
pub use event::{Event, EventDescriptor, EventName, EventType, OutgoingEvent};
pub use handler::{JsonDataModel, NullDataModel};
pub use model::{
    ActiveStates, Configuration, InterpreterModel, StateIndex, StateKind, StateNode,
    TransitionNode, ROOT,
};
