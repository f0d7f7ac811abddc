//! Resolved, immutable interpreter model.
//!
//! States are indexed in document pre-order with the document root at
//! index 0. Every back reference (parent, last descendant, LCCA) is an index,
//! so the model is a flat `Send + Sync` structure shared by all sessions.

use crate::datamodel::{ExecutionScope, StateQuery};
use crate::document::{Binding, HistoryType, TransitionType};
use crate::error::EvaluationError;
use crate::evaluator::{ConditionEvaluator, LocationEvaluator, ScriptEvaluator, ValueEvaluator};
use crate::event::{EventDescriptor, EventName};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type StateIndex = usize;
pub type TransitionIndex = usize;

/// Index of the document root.
pub const ROOT: StateIndex = 0;

/// Type URI of SCXML invocations, used when `<invoke>` names no type.
pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml/";

/// A literal value or a bound expression.
#[derive(Debug, Clone)]
pub enum ValueSource {
    Literal(Value),
    Expr(Arc<dyn ValueEvaluator>),
}

impl ValueSource {
    pub async fn evaluate(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, EvaluationError> {
        match self {
            ValueSource::Literal(value) => Ok(value.clone()),
            ValueSource::Expr(expr) => expr.evaluate_object(scope).await,
        }
    }

    pub async fn evaluate_string(
        &self,
        scope: &mut ExecutionScope<'_>,
    ) -> Result<String, EvaluationError> {
        match self {
            ValueSource::Literal(Value::String(s)) => Ok(s.clone()),
            ValueSource::Literal(other) => Ok(other.to_string()),
            ValueSource::Expr(expr) => expr.evaluate_string(scope).await,
        }
    }
}

/// `<param>` value.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Expr(Arc<dyn ValueEvaluator>),
    Location(Arc<dyn LocationEvaluator>),
}

#[derive(Debug, Clone)]
pub struct ParamNode {
    pub name: String,
    pub value: ParamValue,
}

/// Data attached to sends, invokes and done events.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub namelist: Vec<Arc<dyn LocationEvaluator>>,
    pub params: Vec<ParamNode>,
    pub content: Option<ValueSource>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.namelist.is_empty() && self.params.is_empty() && self.content.is_none()
    }

    /// Content wins; otherwise namelist and params form an object. An empty
    /// payload is `null`.
    pub async fn evaluate(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, EvaluationError> {
        if let Some(content) = &self.content {
            return content.evaluate(scope).await;
        }
        if self.namelist.is_empty() && self.params.is_empty() {
            return Ok(Value::Null);
        }

        let mut data = Map::new();
        for location in &self.namelist {
            let value = location.get_value(scope).await?;
            data.insert(location.location().to_string(), value);
        }
        for param in &self.params {
            let value = match &param.value {
                ParamValue::Expr(expr) => expr.evaluate_object(scope).await?,
                ParamValue::Location(location) => location.get_value(scope).await?,
            };
            data.insert(param.name.clone(), value);
        }
        Ok(Value::Object(data))
    }
}

#[derive(Debug, Clone)]
pub struct SendAction {
    pub event: Option<ValueSource>,
    pub target: Option<ValueSource>,
    pub send_type: Option<ValueSource>,
    pub id: Option<String>,
    pub id_location: Option<Arc<dyn LocationEvaluator>>,
    pub delay: Option<ValueSource>,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: Arc<dyn ConditionEvaluator>,
    pub actions: Vec<Action>,
}

/// Bound executable content.
#[derive(Debug, Clone)]
pub enum Action {
    Raise {
        event: EventName,
    },
    Send(Box<SendAction>),
    Cancel {
        send_id: ValueSource,
    },
    Assign {
        location: Arc<dyn LocationEvaluator>,
        value: ValueSource,
    },
    Log {
        label: Option<String>,
        expr: Option<Arc<dyn ValueEvaluator>>,
    },
    If {
        branches: Vec<IfBranch>,
        otherwise: Vec<Action>,
    },
    Foreach {
        array: Arc<dyn ValueEvaluator>,
        item: Arc<dyn LocationEvaluator>,
        index: Option<Arc<dyn LocationEvaluator>>,
        actions: Vec<Action>,
    },
    Script(Arc<dyn ScriptEvaluator>),
}

#[derive(Debug, Clone)]
pub struct DataNode {
    pub id: String,
    pub value: Option<ValueSource>,
}

#[derive(Debug, Clone)]
pub struct InvokeNode {
    pub id: Option<String>,
    pub id_location: Option<Arc<dyn LocationEvaluator>>,
    pub invoke_type: ValueSource,
    pub src: Option<ValueSource>,
    pub autoforward: bool,
    pub payload: Payload,
    pub finalize: Vec<Action>,
}

/// Node kinds with the fields relevant to each.
#[derive(Debug, Clone)]
pub enum StateKind {
    /// Atomic `<state>`.
    Simple,
    Compound {
        initial: TransitionIndex,
    },
    Parallel,
    Final {
        done_data: Option<Payload>,
    },
    History {
        history_type: HistoryType,
        /// Always set after building; compound parents supply their initial
        /// targets when the document gives no default.
        default: TransitionIndex,
    },
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: String,
    pub index: StateIndex,
    pub parent: Option<StateIndex>,
    pub depth: usize,
    pub last_descendant: StateIndex,
    /// Child states in document order, history pseudostates excluded.
    pub children: Vec<StateIndex>,
    pub history: Vec<StateIndex>,
    pub transitions: Vec<TransitionIndex>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invokes: Vec<InvokeNode>,
    pub data: Vec<DataNode>,
    pub kind: StateKind,
}

impl StateNode {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Simple | StateKind::Final { .. })
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Compound { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StateKind::Parallel)
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Final { .. })
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TransitionNode {
    pub index: TransitionIndex,
    pub source: StateIndex,
    pub events: Vec<EventDescriptor>,
    pub cond: Option<Arc<dyn ConditionEvaluator>>,
    pub targets: Vec<StateIndex>,
    pub kind: TransitionType,
    pub actions: Vec<Action>,
}

impl TransitionNode {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn matches(&self, event: &EventName) -> bool {
        self.events.iter().any(|d| d.matches(event))
    }
}

/// The compiled statechart.
pub struct InterpreterModel {
    pub(crate) name: String,
    pub(crate) checksum: String,
    pub(crate) binding: Binding,
    pub(crate) datamodel: String,
    pub(crate) states: Vec<StateNode>,
    pub(crate) transitions: Vec<TransitionNode>,
    pub(crate) ids: HashMap<String, StateIndex>,
    pub(crate) lcca: Vec<StateIndex>,
    pub(crate) script: Option<Arc<dyn ScriptEvaluator>>,
}

impl InterpreterModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn datamodel(&self) -> &str {
        &self.datamodel
    }

    pub fn script(&self) -> Option<&Arc<dyn ScriptEvaluator>> {
        self.script.as_ref()
    }

    pub fn root(&self) -> &StateNode {
        &self.states[ROOT]
    }

    pub fn states(&self) -> &[StateNode] {
        &self.states
    }

    pub fn state(&self, index: StateIndex) -> &StateNode {
        &self.states[index]
    }

    pub fn transition(&self, index: TransitionIndex) -> &TransitionNode {
        &self.transitions[index]
    }

    pub fn transitions(&self) -> &[TransitionNode] {
        &self.transitions
    }

    pub fn index_of(&self, id: &str) -> Option<StateIndex> {
        self.ids.get(id).copied()
    }

    pub fn state_by_id(&self, id: &str) -> Option<&StateNode> {
        self.index_of(id).map(|i| &self.states[i])
    }

    /// True when `a` is a proper descendant of `b`.
    pub fn is_descendant(&self, a: StateIndex, b: StateIndex) -> bool {
        a > b && a <= self.states[b].last_descendant
    }

    /// Least common compound ancestor of `a` and `b`.
    pub fn lcca(&self, a: StateIndex, b: StateIndex) -> StateIndex {
        self.lcca[a * self.states.len() + b]
    }

    /// Proper ancestors from the parent outwards, stopping before `until`.
    pub fn proper_ancestors(&self, index: StateIndex, until: Option<StateIndex>) -> Vec<StateIndex> {
        let mut out = Vec::new();
        let mut current = self.states[index].parent;
        while let Some(p) = current {
            if Some(p) == until {
                break;
            }
            out.push(p);
            current = self.states[p].parent;
        }
        out
    }

    /// Initial transition of a compound state or the root.
    pub fn initial_transition(&self, index: StateIndex) -> Option<&TransitionNode> {
        match self.states[index].kind {
            StateKind::Compound { initial } => Some(&self.transitions[initial]),
            _ => None,
        }
    }

    /// True when every child region of a parallel state is in a final state.
    pub fn is_in_final_state(&self, index: StateIndex, configuration: &Configuration) -> bool {
        let state = &self.states[index];
        match state.kind {
            StateKind::Compound { .. } => state.children.iter().any(|&c| {
                self.states[c].is_final() && configuration.contains(c)
            }),
            StateKind::Parallel => state
                .children
                .iter()
                .all(|&c| self.is_in_final_state(c, configuration)),
            _ => false,
        }
    }
}

impl fmt::Debug for InterpreterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterModel")
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .field("datamodel", &self.datamodel)
            .field("states", &self.states.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

/// The set of active states, iterated in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration(BTreeSet<StateIndex>);

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: StateIndex) -> bool {
        self.0.insert(index)
    }

    pub fn remove(&mut self, index: StateIndex) -> bool {
        self.0.remove(&index)
    }

    pub fn contains(&self, index: StateIndex) -> bool {
        self.0.contains(&index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = StateIndex> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Active atomic states in document order.
    pub fn atomic_states(&self, model: &InterpreterModel) -> Vec<StateIndex> {
        self.iter().filter(|&s| model.state(s).is_atomic()).collect()
    }

    pub fn ids(&self, model: &InterpreterModel) -> Vec<String> {
        self.iter().map(|s| model.state(s).id.clone()).collect()
    }

    pub fn from_ids<S: AsRef<str>>(model: &InterpreterModel, ids: &[S]) -> Result<Self, String> {
        let mut config = Self::new();
        for id in ids {
            let index = model
                .index_of(id.as_ref())
                .ok_or_else(|| format!("unknown state '{}'", id.as_ref()))?;
            config.insert(index);
        }
        Ok(config)
    }

    /// Checks that ancestors of active states are active, compound states
    /// have exactly one active child and parallel states have all of theirs.
    pub fn check_consistency(&self, model: &InterpreterModel) -> Result<(), String> {
        for index in self.iter() {
            let state = model.state(index);
            if state.is_history() || index == ROOT {
                return Err(format!("'{}' cannot be active", state.id));
            }
            if let Some(parent) = state.parent.filter(|&p| p != ROOT) {
                if !self.contains(parent) {
                    return Err(format!(
                        "'{}' is active but its parent '{}' is not",
                        state.id,
                        model.state(parent).id
                    ));
                }
            }
            let active_children = state.children.iter().filter(|&&c| self.contains(c)).count();
            match state.kind {
                StateKind::Compound { .. } if active_children != 1 => {
                    return Err(format!(
                        "compound '{}' has {} active children",
                        state.id, active_children
                    ));
                }
                StateKind::Parallel if active_children != state.children.len() => {
                    return Err(format!("parallel '{}' is missing a region", state.id));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// `In()` view over a model and configuration.
pub struct ActiveStates<'a> {
    model: &'a InterpreterModel,
    configuration: &'a Configuration,
}

impl<'a> ActiveStates<'a> {
    pub fn new(model: &'a InterpreterModel, configuration: &'a Configuration) -> Self {
        Self {
            model,
            configuration,
        }
    }
}

impl StateQuery for ActiveStates<'_> {
    fn is_active(&self, state_id: &str) -> bool {
        self.model
            .index_of(state_id)
            .map(|i| self.configuration.contains(i))
            .unwrap_or(false)
    }
}
