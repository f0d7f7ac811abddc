//! Interpreter model builder.
//!
//! One traversal of the document assigns document-order indices, binds every
//! expression through the document's data-model handler and records target
//! ids; a resolution pass then resolves targets, fills in history defaults and
//! computes the LCCA table. Problems are collected, never short-circuited.

use crate::document::{
    ActionElement, ContentElement, DataElement, Document, DoneDataDefinition, HistoryType,
    InvokeDefinition, ParamElement, SendElement, StateDefinition, StateElement,
    TransitionDefinition, TransitionType,
};
use crate::error::{ValidationError, ValidationErrors};
use crate::evaluator::{ConditionEvaluator, DataModelHandler, DataModelRegistry};
use crate::event::{parse_delay, EventDescriptor, EventName};
use crate::handler::JsonDataModel;
use crate::model::{
    Action, DataNode, IfBranch, InterpreterModel, InvokeNode, ParamNode, ParamValue, Payload,
    SendAction, StateIndex, StateKind, StateNode, TransitionIndex, TransitionNode, ValueSource,
    ROOT, SCXML_INVOKE_TYPE,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

const INTERNAL_TARGET: &str = "#_internal";

/// Builds an interpreter model from a document.
pub fn build(
    document: &Document,
    registry: &DataModelRegistry,
) -> Result<InterpreterModel, ValidationErrors> {
    InterpreterModelBuilder::new(registry).build(document)
}

/// Compiles documents against a data-model registry.
#[derive(Debug, Clone)]
pub struct InterpreterModelBuilder<'a> {
    registry: &'a DataModelRegistry,
}

impl<'a> InterpreterModelBuilder<'a> {
    pub fn new(registry: &'a DataModelRegistry) -> Self {
        Self { registry }
    }

    pub fn build(&self, document: &Document) -> Result<InterpreterModel, ValidationErrors> {
        let mut errors = Vec::new();

        let datamodel = document
            .datamodel
            .clone()
            .unwrap_or_else(|| self.registry.default_name().to_string());
        let handler = match self.registry.get(&datamodel) {
            Some(handler) => handler,
            None => {
                errors.push(ValidationError::new(
                    "scxml",
                    format!(
                        "unknown data model '{}' (known: {})",
                        datamodel,
                        self.registry.names().join(", ")
                    ),
                ));
                self.registry
                    .resolve(None)
                    .unwrap_or_else(|| Arc::new(JsonDataModel))
            }
        };

        let mut user_ids = HashSet::new();
        collect_ids(&document.states, &mut user_ids);

        let mut ctx = BuildContext {
            handler,
            states: Vec::new(),
            transitions: Vec::new(),
            ids: HashMap::new(),
            user_ids,
            generated: 0,
            pending: Vec::new(),
            histories: Vec::new(),
            errors,
        };

        ctx.visit_root(document);
        ctx.resolve();

        let script = match &document.script {
            Some(script) => {
                let bound = ctx.handler.script(&script.source);
                ctx.bind(bound, "scxml/script")
            }
            None => None,
        };

        let checksum = match document.checksum() {
            Ok(checksum) => checksum,
            Err(e) => {
                ctx.error("scxml", format!("cannot serialize document: {}", e));
                String::new()
            }
        };

        if !ctx.errors.is_empty() {
            return Err(ValidationErrors(ctx.errors));
        }

        let lcca = compute_lcca(&ctx.states);
        let model = InterpreterModel {
            name: document.name.clone().unwrap_or_default(),
            checksum,
            binding: document.binding,
            datamodel: ctx.handler.name().to_string(),
            states: ctx.states,
            transitions: ctx.transitions,
            ids: ctx.ids,
            lcca,
            script,
        };

        debug!(
            "Built interpreter model {} ({} states, {} transitions)",
            model.name(),
            model.states().len(),
            model.transitions().len()
        );

        Ok(model)
    }
}

struct PendingTargets {
    transition: TransitionIndex,
    targets: Vec<String>,
    path: String,
}

struct BuildContext {
    handler: Arc<dyn DataModelHandler>,
    states: Vec<StateNode>,
    transitions: Vec<TransitionNode>,
    ids: HashMap<String, StateIndex>,
    user_ids: HashSet<String>,
    generated: usize,
    pending: Vec<PendingTargets>,
    histories: Vec<(StateIndex, String, bool)>,
    errors: Vec<ValidationError>,
}

fn collect_ids(elements: &[StateElement], out: &mut HashSet<String>) {
    for element in elements {
        if let Some(id) = element.id() {
            out.insert(id.to_string());
        }
        let children = match element {
            StateElement::State(s) => &s.states,
            StateElement::Parallel(p) => &p.states,
            StateElement::Final(f) => &f.states,
            StateElement::History(_) => continue,
        };
        collect_ids(children, out);
    }
}

impl BuildContext {
    fn error(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationError::new(path, message));
    }

    fn bind<T>(&mut self, result: Result<T, String>, path: &str) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(message) => {
                self.error(path, message);
                None
            }
        }
    }

    fn exclusive(&mut self, path: &str, a: (&str, bool), b: (&str, bool)) {
        if a.1 && b.1 {
            self.error(
                path,
                format!("'{}' and '{}' are mutually exclusive", a.0, b.0),
            );
        }
    }

    fn generate_id(&mut self, tag: &str) -> String {
        loop {
            self.generated += 1;
            let id = format!("_{}.{}", tag, self.generated);
            if !self.user_ids.contains(&id) && !self.ids.contains_key(&id) {
                return id;
            }
        }
    }

    fn push_placeholder(&mut self, id: String, parent: Option<StateIndex>, depth: usize) -> StateIndex {
        let index = self.states.len();
        self.states.push(StateNode {
            id,
            index,
            parent,
            depth,
            last_descendant: index,
            children: Vec::new(),
            history: Vec::new(),
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invokes: Vec::new(),
            data: Vec::new(),
            kind: StateKind::Simple,
        });
        index
    }

    fn push_transition(
        &mut self,
        source: StateIndex,
        events: Vec<EventDescriptor>,
        cond: Option<Arc<dyn ConditionEvaluator>>,
        kind: TransitionType,
        actions: Vec<Action>,
    ) -> TransitionIndex {
        let index = self.transitions.len();
        self.transitions.push(TransitionNode {
            index,
            source,
            events,
            cond,
            targets: Vec::new(),
            kind,
            actions,
        });
        index
    }

    fn visit_root(&mut self, document: &Document) {
        let root_id = document.name.clone().unwrap_or_else(|| "scxml".to_string());
        self.push_placeholder(root_id, None, 0);
        let path = "scxml";

        if document.states.is_empty() {
            self.error(path, "document declares no states");
        }

        let root_data = self.build_data(&document.data, path);
        self.states[ROOT].data = root_data;

        let (children, history) = self.visit_children(&document.states, ROOT, 1, path);
        for &h in &history {
            self.error(
                &format!("{}/history[{}]", path, self.states[h].id),
                "history pseudostates cannot be top-level",
            );
        }
        self.states[ROOT].children = children.clone();
        self.states[ROOT].last_descendant = self.states.len() - 1;

        if let Some(&first) = children.first() {
            let initial = self.push_transition(ROOT, Vec::new(), None, TransitionType::External, Vec::new());
            if document.initial.is_empty() {
                self.transitions[initial].targets = vec![first];
            } else {
                self.pending.push(PendingTargets {
                    transition: initial,
                    targets: document.initial.clone(),
                    path: format!("{}/@initial", path),
                });
            }
            self.states[ROOT].kind = StateKind::Compound { initial };
        }
    }

    /// Visits child elements; returns (child states, history pseudostates).
    fn visit_children(
        &mut self,
        elements: &[StateElement],
        parent: StateIndex,
        depth: usize,
        path: &str,
    ) -> (Vec<StateIndex>, Vec<StateIndex>) {
        let mut children = Vec::new();
        let mut history = Vec::new();
        for (position, element) in elements.iter().enumerate() {
            let index = self.visit(element, parent, depth, path, position);
            if matches!(element, StateElement::History(_)) {
                history.push(index);
            } else {
                children.push(index);
            }
        }
        (children, history)
    }

    fn visit(
        &mut self,
        element: &StateElement,
        parent: StateIndex,
        depth: usize,
        parent_path: &str,
        position: usize,
    ) -> StateIndex {
        let tag = element.tag();
        let path = match element.id() {
            Some(id) => format!("{}/{}[{}]", parent_path, tag, id),
            None => format!("{}/{}#{}", parent_path, tag, position),
        };

        let id = match element.id() {
            Some(id) if id.is_empty() => {
                self.error(&path, "state id must not be empty");
                self.generate_id(tag)
            }
            Some(id) => {
                if self.ids.contains_key(id) {
                    self.error(&path, format!("duplicate state id '{}'", id));
                }
                if let Err(e) = EventName::check_suffix(id) {
                    self.error(&path, format!("state id cannot name a done event: {}", e));
                }
                id.to_string()
            }
            None => self.generate_id(tag),
        };

        let index = self.push_placeholder(id.clone(), Some(parent), depth);
        self.ids.entry(id).or_insert(index);

        match element {
            StateElement::State(def) => {
                self.states[index].data = self.build_data(&def.data, &path);
                let (children, history) =
                    self.visit_children(&def.states, index, depth + 1, &path);
                self.states[index].on_entry = self.build_actions(&def.on_entry, &format!("{}/onentry", path));
                self.states[index].on_exit = self.build_actions(&def.on_exit, &format!("{}/onexit", path));
                self.states[index].invokes = self.build_invokes(&def.invoke, &path);
                self.states[index].transitions = self.build_transitions(index, &def.transitions, &path);

                let has_initial = !def.initial.is_empty() || def.initial_transition.is_some();
                if children.is_empty() {
                    if has_initial {
                        self.error(&path, "atomic state cannot declare an initial");
                    }
                    if !history.is_empty() {
                        self.error(&path, "atomic state cannot contain history");
                    }
                } else {
                    self.exclusive(
                        &path,
                        ("initial", !def.initial.is_empty()),
                        ("<initial>", def.initial_transition.is_some()),
                    );
                    let initial = self.build_initial(index, def, children[0], &path);
                    self.states[index].kind = StateKind::Compound { initial };
                }
                self.states[index].children = children;
                self.states[index].history = history;
            }
            StateElement::Parallel(def) => {
                self.states[index].data = self.build_data(&def.data, &path);
                let (children, history) =
                    self.visit_children(&def.states, index, depth + 1, &path);
                self.states[index].on_entry = self.build_actions(&def.on_entry, &format!("{}/onentry", path));
                self.states[index].on_exit = self.build_actions(&def.on_exit, &format!("{}/onexit", path));
                self.states[index].invokes = self.build_invokes(&def.invoke, &path);
                self.states[index].transitions = self.build_transitions(index, &def.transitions, &path);
                self.states[index].kind = StateKind::Parallel;
                self.states[index].children = children;
                self.states[index].history = history;
            }
            StateElement::Final(def) => {
                if !def.states.is_empty() {
                    self.error(&path, "final state cannot have child states");
                }
                if !def.transitions.is_empty() {
                    self.error(&path, "final state cannot have transitions");
                }
                self.states[index].on_entry = self.build_actions(&def.on_entry, &format!("{}/onentry", path));
                self.states[index].on_exit = self.build_actions(&def.on_exit, &format!("{}/onexit", path));
                let done_data = def
                    .done_data
                    .as_ref()
                    .map(|d| self.build_done_data(d, &format!("{}/donedata", path)));
                self.states[index].kind = StateKind::Final { done_data };
            }
            StateElement::History(def) => {
                let default = match &def.transition {
                    Some(t) => {
                        let t_path = format!("{}/transition", path);
                        if t.event.is_some() || t.cond.is_some() {
                            self.error(&t_path, "history default transition cannot have event or cond");
                        }
                        let actions = self.build_actions(&t.actions, &t_path);
                        let ti = self.push_transition(index, Vec::new(), None, TransitionType::External, actions);
                        if t.target.is_empty() {
                            self.error(&t_path, "history default transition needs a target");
                        } else {
                            self.pending.push(PendingTargets {
                                transition: ti,
                                targets: t.target.clone(),
                                path: t_path,
                            });
                        }
                        ti
                    }
                    None => usize::MAX,
                };
                self.histories.push((index, path.clone(), def.transition.is_some()));
                self.states[index].kind = StateKind::History {
                    history_type: def.history_type,
                    default,
                };
            }
        }

        self.states[index].last_descendant = self.states.len() - 1;
        index
    }

    fn build_initial(
        &mut self,
        index: StateIndex,
        def: &StateDefinition,
        first_child: StateIndex,
        path: &str,
    ) -> TransitionIndex {
        if let Some(t) = &def.initial_transition {
            let t_path = format!("{}/initial", path);
            if t.event.is_some() || t.cond.is_some() {
                self.error(&t_path, "initial transition cannot have event or cond");
            }
            let actions = self.build_actions(&t.actions, &t_path);
            let ti = self.push_transition(index, Vec::new(), None, TransitionType::External, actions);
            if t.target.is_empty() {
                self.error(&t_path, "initial transition needs a target");
            } else {
                self.pending.push(PendingTargets {
                    transition: ti,
                    targets: t.target.clone(),
                    path: t_path,
                });
            }
            return ti;
        }

        let ti = self.push_transition(index, Vec::new(), None, TransitionType::External, Vec::new());
        if def.initial.is_empty() {
            self.transitions[ti].targets = vec![first_child];
        } else {
            self.pending.push(PendingTargets {
                transition: ti,
                targets: def.initial.clone(),
                path: format!("{}/@initial", path),
            });
        }
        ti
    }

    fn build_transitions(
        &mut self,
        source: StateIndex,
        defs: &[TransitionDefinition],
        path: &str,
    ) -> Vec<TransitionIndex> {
        defs.iter()
            .enumerate()
            .map(|(i, def)| self.build_transition(source, def, &format!("{}/transition[{}]", path, i)))
            .collect()
    }

    fn build_transition(
        &mut self,
        source: StateIndex,
        def: &TransitionDefinition,
        path: &str,
    ) -> TransitionIndex {
        let events = match def.event.as_deref() {
            Some(event) => match EventDescriptor::parse_list(event) {
                Ok(events) => events,
                Err(e) => {
                    self.error(path, e.to_string());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let cond = match def.cond.as_deref() {
            Some(cond) => {
                let bound = self.handler.condition(cond);
                self.bind(bound, &format!("{}/@cond", path))
            }
            None => None,
        };
        let actions = self.build_actions(&def.actions, path);
        let ti = self.push_transition(source, events, cond, def.transition_type, actions);
        if !def.target.is_empty() {
            self.pending.push(PendingTargets {
                transition: ti,
                targets: def.target.clone(),
                path: path.to_string(),
            });
        }
        ti
    }

    fn build_data(&mut self, data: &[DataElement], path: &str) -> Vec<DataNode> {
        if !data.is_empty() && !self.handler.supports_data() {
            self.error(
                path,
                format!("the {} data model does not support <data>", self.handler.name()),
            );
            return Vec::new();
        }

        let mut out = Vec::with_capacity(data.len());
        for element in data {
            let d_path = format!("{}/data[{}]", path, element.id);
            if element.id.is_empty() {
                self.error(&d_path, "data id must not be empty");
                continue;
            }
            self.exclusive(
                &d_path,
                ("expr", element.expr.is_some()),
                ("content", element.content.is_some()),
            );
            let value = match (&element.expr, &element.content) {
                (Some(expr), _) => {
                    let bound = self.handler.value(expr);
                    self.bind(bound, &d_path).map(ValueSource::Expr)
                }
                (None, Some(content)) => Some(ValueSource::Literal(content.clone())),
                (None, None) => None,
            };
            out.push(DataNode {
                id: element.id.clone(),
                value,
            });
        }
        out
    }

    fn build_actions(&mut self, actions: &[ActionElement], path: &str) -> Vec<Action> {
        let mut out = Vec::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            if let Some(built) = self.build_action(action, &format!("{}/action[{}]", path, i)) {
                out.push(built);
            }
        }
        out
    }

    fn build_action(&mut self, action: &ActionElement, path: &str) -> Option<Action> {
        match action {
            ActionElement::Raise { event } => match EventName::parse(event) {
                Ok(event) => Some(Action::Raise { event }),
                Err(e) => {
                    self.error(path, e.to_string());
                    None
                }
            },
            ActionElement::Send(send) => self
                .build_send(send, path)
                .map(|s| Action::Send(Box::new(s))),
            ActionElement::Cancel {
                sendid,
                sendidexpr,
            } => {
                self.exclusive(path, ("sendid", sendid.is_some()), ("sendidexpr", sendidexpr.is_some()));
                let send_id = self.literal_or_expr(sendid, sendidexpr, path)?;
                match send_id {
                    Some(send_id) => Some(Action::Cancel { send_id }),
                    None => {
                        self.error(path, "cancel requires 'sendid' or 'sendidexpr'");
                        None
                    }
                }
            }
            ActionElement::Assign {
                location,
                expr,
                content,
            } => {
                self.exclusive(path, ("expr", expr.is_some()), ("content", content.is_some()));
                let bound = self.handler.location(location);
                let location = self.bind(bound, path);
                let value = match (expr, content) {
                    (Some(expr), _) => {
                        let bound = self.handler.value(expr);
                        self.bind(bound, path).map(ValueSource::Expr)
                    }
                    (None, Some(content)) => Some(ValueSource::Literal(content.clone())),
                    (None, None) => {
                        self.error(path, "assign requires 'expr' or 'content'");
                        None
                    }
                };
                Some(Action::Assign {
                    location: location?,
                    value: value?,
                })
            }
            ActionElement::Log { label, expr } => {
                let expr = match expr {
                    Some(expr) => {
                        let bound = self.handler.value(expr);
                        Some(self.bind(bound, path)?)
                    }
                    None => None,
                };
                Some(Action::Log {
                    label: label.clone(),
                    expr,
                })
            }
            ActionElement::If {
                cond,
                then,
                else_if,
                otherwise,
            } => {
                let mut branches = Vec::with_capacity(1 + else_if.len());
                let bound = self.handler.condition(cond);
                let first = self.bind(bound, path);
                let then = self.build_actions(then, &format!("{}/then", path));
                if let Some(cond) = first {
                    branches.push(IfBranch {
                        cond,
                        actions: then,
                    });
                }
                for (i, branch) in else_if.iter().enumerate() {
                    let b_path = format!("{}/elseif[{}]", path, i);
                    let bound = self.handler.condition(&branch.cond);
                    let cond = self.bind(bound, &b_path);
                    let actions = self.build_actions(&branch.actions, &b_path);
                    if let Some(cond) = cond {
                        branches.push(IfBranch { cond, actions });
                    }
                }
                let otherwise = self.build_actions(otherwise, &format!("{}/else", path));
                Some(Action::If {
                    branches,
                    otherwise,
                })
            }
            ActionElement::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let bound = self.handler.value(array);
                let array = self.bind(bound, path);
                let bound = self.handler.location(item);
                let item = self.bind(bound, path);
                let index = match index {
                    Some(index) => {
                        let bound = self.handler.location(index);
                        Some(self.bind(bound, path)?)
                    }
                    None => None,
                };
                let actions = self.build_actions(actions, path);
                Some(Action::Foreach {
                    array: array?,
                    item: item?,
                    index,
                    actions,
                })
            }
            ActionElement::Script { source } => {
                let bound = self.handler.script(source);
                self.bind(bound, path).map(Action::Script)
            }
        }
    }

    /// Builds a value source from a literal/expression attribute pair.
    /// Returns `None` when the expression failed to bind.
    fn literal_or_expr(
        &mut self,
        literal: &Option<String>,
        expr: &Option<String>,
        path: &str,
    ) -> Option<Option<ValueSource>> {
        match (literal, expr) {
            (Some(literal), _) => Some(Some(ValueSource::Literal(Value::String(literal.clone())))),
            (None, Some(expr)) => {
                let bound = self.handler.value(expr);
                self.bind(bound, path).map(|e| Some(ValueSource::Expr(e)))
            }
            (None, None) => Some(None),
        }
    }

    fn build_send(&mut self, send: &SendElement, path: &str) -> Option<SendAction> {
        self.exclusive(path, ("event", send.event.is_some()), ("eventexpr", send.eventexpr.is_some()));
        self.exclusive(path, ("target", send.target.is_some()), ("targetexpr", send.targetexpr.is_some()));
        self.exclusive(path, ("type", send.send_type.is_some()), ("typeexpr", send.typeexpr.is_some()));
        self.exclusive(path, ("id", send.id.is_some()), ("idlocation", send.idlocation.is_some()));
        self.exclusive(path, ("delay", send.delay.is_some()), ("delayexpr", send.delayexpr.is_some()));

        if send.event.is_none() && send.eventexpr.is_none() {
            self.error(path, "send requires 'event' or 'eventexpr'");
        }
        if let Some(event) = &send.event {
            if let Err(e) = EventName::parse(event) {
                self.error(path, e.to_string());
            }
        }
        if let Some(delay) = &send.delay {
            if let Err(e) = parse_delay(delay) {
                self.error(path, e.to_string());
            }
        }
        let delayed = send.delay.is_some() || send.delayexpr.is_some();
        if delayed && send.target.as_deref() == Some(INTERNAL_TARGET) {
            self.error(path, "delayed send to '#_internal' is not allowed");
        }

        let event = self.literal_or_expr(&send.event, &send.eventexpr, path);
        let target = self.literal_or_expr(&send.target, &send.targetexpr, path);
        let send_type = self.literal_or_expr(&send.send_type, &send.typeexpr, path);
        let delay = self.literal_or_expr(&send.delay, &send.delayexpr, path);
        let id_location = match &send.idlocation {
            Some(location) => {
                let bound = self.handler.location(location);
                Some(self.bind(bound, path))
            }
            None => None,
        };
        let payload = self.build_payload(&send.namelist, &send.params, send.content.as_ref(), path);

        Some(SendAction {
            event: event?,
            target: target?,
            send_type: send_type?,
            id: send.id.clone(),
            id_location: match id_location {
                Some(bound) => Some(bound?),
                None => None,
            },
            delay: delay?,
            payload: payload?,
        })
    }

    fn build_payload(
        &mut self,
        namelist: &[String],
        params: &[ParamElement],
        content: Option<&ContentElement>,
        path: &str,
    ) -> Option<Payload> {
        if content.is_some() && (!namelist.is_empty() || !params.is_empty()) {
            self.error(path, "'content' is mutually exclusive with 'namelist' and <param>");
        }

        let mut ok = true;
        let mut payload = Payload::default();
        for name in namelist {
            let bound = self.handler.location(name);
            match self.bind(bound, path) {
                Some(location) => payload.namelist.push(location),
                None => ok = false,
            }
        }
        for param in params {
            let p_path = format!("{}/param[{}]", path, param.name);
            self.exclusive(&p_path, ("expr", param.expr.is_some()), ("location", param.location.is_some()));
            let value = match (&param.expr, &param.location) {
                (Some(expr), _) => {
                    let bound = self.handler.value(expr);
                    self.bind(bound, &p_path).map(ParamValue::Expr)
                }
                (None, Some(location)) => {
                    let bound = self.handler.location(location);
                    self.bind(bound, &p_path).map(ParamValue::Location)
                }
                (None, None) => {
                    self.error(&p_path, "param requires 'expr' or 'location'");
                    None
                }
            };
            match value {
                Some(value) => payload.params.push(ParamNode {
                    name: param.name.clone(),
                    value,
                }),
                None => ok = false,
            }
        }
        if let Some(content) = content {
            let c_path = format!("{}/content", path);
            self.exclusive(&c_path, ("expr", content.expr.is_some()), ("body", content.body.is_some()));
            payload.content = match (&content.expr, &content.body) {
                (Some(expr), _) => {
                    let bound = self.handler.value(expr);
                    match self.bind(bound, &c_path) {
                        Some(e) => Some(ValueSource::Expr(e)),
                        None => {
                            ok = false;
                            None
                        }
                    }
                }
                (None, Some(body)) => Some(ValueSource::Literal(body.clone())),
                (None, None) => Some(ValueSource::Literal(Value::Null)),
            };
        }

        ok.then_some(payload)
    }

    fn build_done_data(&mut self, def: &DoneDataDefinition, path: &str) -> Payload {
        self.build_payload(&[], &def.params, def.content.as_ref(), path)
            .unwrap_or_default()
    }

    fn build_invokes(&mut self, defs: &[InvokeDefinition], path: &str) -> Vec<InvokeNode> {
        let mut out = Vec::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            let i_path = format!("{}/invoke[{}]", path, i);
            if let Some(invoke) = self.build_invoke(def, &i_path) {
                out.push(invoke);
            }
        }
        out
    }

    fn build_invoke(&mut self, def: &InvokeDefinition, path: &str) -> Option<InvokeNode> {
        self.exclusive(path, ("id", def.id.is_some()), ("idlocation", def.idlocation.is_some()));
        if let Some(id) = &def.id {
            if let Err(e) = EventName::check_suffix(id) {
                self.error(path, format!("invoke id cannot name a done event: {}", e));
            }
        }
        self.exclusive(path, ("type", def.invoke_type.is_some()), ("typeexpr", def.typeexpr.is_some()));
        self.exclusive(path, ("src", def.src.is_some()), ("srcexpr", def.srcexpr.is_some()));
        if def.content.is_some() && (def.src.is_some() || def.srcexpr.is_some()) {
            self.error(path, "'content' is mutually exclusive with 'src' and 'srcexpr'");
        }

        let invoke_type = self.literal_or_expr(&def.invoke_type, &def.typeexpr, path);
        let src = self.literal_or_expr(&def.src, &def.srcexpr, path);
        let id_location = match &def.idlocation {
            Some(location) => {
                let bound = self.handler.location(location);
                Some(self.bind(bound, path))
            }
            None => None,
        };
        let payload = self.build_payload(&def.namelist, &def.params, def.content.as_ref(), path);
        let finalize = self.build_actions(&def.finalize, &format!("{}/finalize", path));

        Some(InvokeNode {
            id: def.id.clone(),
            id_location: match id_location {
                Some(bound) => Some(bound?),
                None => None,
            },
            invoke_type: invoke_type?.unwrap_or_else(|| {
                ValueSource::Literal(Value::String(SCXML_INVOKE_TYPE.to_string()))
            }),
            src: src?,
            autoforward: def.autoforward,
            payload: payload?,
            finalize,
        })
    }

    /// Resolves target ids and validates everything that depends on them.
    fn resolve(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            let mut targets = Vec::with_capacity(p.targets.len());
            for id in &p.targets {
                match self.ids.get(id) {
                    Some(&index) => targets.push(index),
                    None => self.error(&p.path, format!("unknown target '{}'", id)),
                }
            }
            self.transitions[p.transition].targets = targets;
        }

        for index in 0..self.states.len() {
            if let StateKind::Compound { initial } = self.states[index].kind {
                let targets = self.transitions[initial].targets.clone();
                for t in targets {
                    if !self.is_descendant(t, index) {
                        let (id, target) = (self.states[index].id.clone(), self.states[t].id.clone());
                        self.error(
                            &format!("state[{}]", id),
                            format!("initial target '{}' is not a descendant of '{}'", target, id),
                        );
                    }
                }
            }
        }

        let histories = std::mem::take(&mut self.histories);
        for (history, path, has_default) in histories {
            let Some(parent) = self.states[history].parent else {
                continue;
            };
            let StateKind::History { history_type, .. } = self.states[history].kind else {
                continue;
            };

            if has_default {
                let StateKind::History { default, .. } = self.states[history].kind else {
                    continue;
                };
                let targets = self.transitions[default].targets.clone();
                for t in targets {
                    let valid = match history_type {
                        HistoryType::Shallow => self.states[t].parent == Some(parent),
                        HistoryType::Deep => self.is_descendant(t, parent),
                    };
                    if !valid {
                        let target = self.states[t].id.clone();
                        self.error(
                            &path,
                            format!(
                                "default target '{}' must be a {} of the history's parent",
                                target,
                                match history_type {
                                    HistoryType::Shallow => "child",
                                    HistoryType::Deep => "descendant",
                                }
                            ),
                        );
                    }
                }
                continue;
            }

            match self.states[parent].kind {
                StateKind::Compound { initial } => {
                    let targets = self.transitions[initial].targets.clone();
                    let ti = self.push_transition(history, Vec::new(), None, TransitionType::External, Vec::new());
                    self.transitions[ti].targets = targets;
                    self.states[history].kind = StateKind::History {
                        history_type,
                        default: ti,
                    };
                }
                StateKind::Parallel => {
                    self.error(&path, "history inside a parallel state needs a default transition");
                }
                _ => {}
            }
        }
    }

    fn is_descendant(&self, a: StateIndex, b: StateIndex) -> bool {
        a > b && a <= self.states[b].last_descendant
    }
}

/// LCCA for every ordered pair: innermost compound ancestor (or the root)
/// that is a proper ancestor of `a` and of `b`.
fn compute_lcca(states: &[StateNode]) -> Vec<StateIndex> {
    let n = states.len();
    let mut table = vec![ROOT; n * n];
    for a in 0..n {
        for b in 0..n {
            let mut current = states[a].parent;
            while let Some(p) = current {
                let node = &states[p];
                let compound = p == ROOT || node.is_compound();
                if compound && b > p && b <= node.last_descendant {
                    table[a * n + b] = p;
                    break;
                }
                current = node.parent;
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Configuration;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_json(&value).unwrap()
    }

    fn build_ok(value: Value) -> InterpreterModel {
        build(&doc(value), &DataModelRegistry::default()).unwrap()
    }

    fn build_err(value: Value) -> ValidationErrors {
        build(&doc(value), &DataModelRegistry::default()).unwrap_err()
    }

    fn nested() -> InterpreterModel {
        build_ok(json!({
            "name": "nested",
            "states": [
                {"kind": "state", "id": "a", "states": [
                    {"kind": "state", "id": "a1", "transitions": [{"event": "go", "target": "b"}]},
                    {"kind": "state", "id": "a2"},
                    {"kind": "history", "id": "ah", "type": "deep"}
                ]},
                {"kind": "parallel", "id": "b", "states": [
                    {"kind": "state", "id": "b1"},
                    {"kind": "state", "id": "b2", "states": [
                        {"kind": "final", "id": "b2f"}
                    ]}
                ]}
            ]
        }))
    }

    #[test]
    fn test_document_order_indices() {
        let model = nested();
        let ids: Vec<&str> = model.states().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["nested", "a", "a1", "a2", "ah", "b", "b1", "b2", "b2f"]);
        assert_eq!(model.index_of("nested"), None);
        assert_eq!(model.index_of("a2"), Some(3));

        let a = model.state_by_id("a").unwrap();
        assert!(a.is_compound());
        assert_eq!(a.children, vec![2, 3]);
        assert_eq!(a.history, vec![4]);
        assert_eq!(a.last_descendant, 4);
        assert_eq!(model.state(2).depth, 2);
        assert!(model.state_by_id("b").unwrap().is_parallel());
        assert_eq!(model.root().last_descendant, 8);
    }

    #[test]
    fn test_descendants_and_lcca() {
        let model = nested();
        assert!(model.is_descendant(2, 1));
        assert!(!model.is_descendant(1, 1));
        assert!(!model.is_descendant(5, 1));

        // a1 and a2 meet in compound a
        assert_eq!(model.lcca(2, 3), 1);
        // b1 and b2f: parallel b is skipped
        assert_eq!(model.lcca(6, 8), ROOT);
        // b2f and b2 lcca is the root since b2 is not a proper ancestor of itself
        assert_eq!(model.lcca(8, 7), ROOT);
        assert_eq!(model.lcca(2, 6), ROOT);
        assert_eq!(model.proper_ancestors(8, None), vec![7, 5, 0]);
        assert_eq!(model.proper_ancestors(8, Some(5)), vec![7]);
    }

    #[test]
    fn test_initial_resolution() {
        let model = nested();
        let root_initial = model.initial_transition(ROOT).unwrap();
        assert_eq!(root_initial.targets, vec![1]);
        let a_initial = model.initial_transition(1).unwrap();
        assert_eq!(a_initial.targets, vec![2]);

        // deep history without default inherits a's initial targets
        match model.state(4).kind {
            StateKind::History { history_type, default } => {
                assert_eq!(history_type, HistoryType::Deep);
                assert_eq!(model.transition(default).targets, vec![2]);
            }
            ref other => panic!("expected history, got {:?}", other),
        }
        let go = model.transition(model.state(2).transitions[0]);
        assert_eq!(go.targets, vec![5]);
        assert!(go.matches(&EventName::parse("go").unwrap()));
    }

    #[test]
    fn test_initial_attribute_and_element() {
        let model = build_ok(json!({
            "initial": "s2",
            "states": [
                {"kind": "state", "id": "s1"},
                {"kind": "state", "id": "s2", "initial_transition": {"target": "s22", "actions": [
                    {"action": "log", "expr": "1"}
                ]}, "states": [
                    {"kind": "state", "id": "s21"},
                    {"kind": "state", "id": "s22"}
                ]}
            ]
        }));
        assert_eq!(model.initial_transition(ROOT).unwrap().targets, vec![2]);
        let s2 = model.initial_transition(2).unwrap();
        assert_eq!(s2.targets, vec![4]);
        assert_eq!(s2.actions.len(), 1);
    }

    #[test]
    fn test_collects_all_errors() {
        let errors = build_err(json!({
            "states": [
                {"kind": "state", "id": "dup", "transitions": [
                    {"event": "a.*b", "target": "nowhere"}
                ]},
                {"kind": "state", "id": "dup"},
                {"kind": "final", "id": "f", "transitions": [{"target": "dup"}]}
            ]
        }));
        assert!(errors.len() >= 4, "{}", errors);
        assert!(errors.mentions("duplicate state id 'dup'"));
        assert!(errors.mentions("unknown target 'nowhere'"));
        assert!(errors.mentions("a.*b"));
        assert!(errors.mentions("final state cannot have transitions"));
    }

    #[test]
    fn test_initial_validation() {
        let errors = build_err(json!({
            "states": [
                {"kind": "state", "id": "leaf", "initial": "x"},
                {"kind": "state", "id": "both", "initial": "c1",
                 "initial_transition": {"target": "c1", "event": "e"},
                 "states": [{"kind": "state", "id": "c1"}]},
                {"kind": "state", "id": "outside", "initial": "leaf",
                 "states": [{"kind": "state", "id": "c2"}]}
            ]
        }));
        assert!(errors.mentions("atomic state cannot declare an initial"));
        assert!(errors.mentions("mutually exclusive"));
        assert!(errors.mentions("initial transition cannot have event or cond"));
        assert!(errors.mentions("initial target 'leaf' is not a descendant of 'outside'"));
    }

    #[test]
    fn test_history_validation() {
        let errors = build_err(json!({
            "states": [
                {"kind": "parallel", "id": "p", "states": [
                    {"kind": "history", "id": "ph"},
                    {"kind": "state", "id": "r1"}
                ]},
                {"kind": "state", "id": "c", "states": [
                    {"kind": "history", "id": "ch", "transition": {"target": "deep"}},
                    {"kind": "state", "id": "mid", "states": [{"kind": "state", "id": "deep"}]}
                ]}
            ]
        }));
        assert!(errors.mentions("history inside a parallel state needs a default transition"));
        assert!(errors.mentions("default target 'deep' must be a child"));
    }

    #[test]
    fn test_generated_ids_do_not_collide() {
        let model = build_ok(json!({
            "states": [
                {"kind": "state", "id": "_state.1"},
                {"kind": "state"},
                {"kind": "final"}
            ]
        }));
        let ids: Vec<&str> = model.states()[1..].iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids[0], "_state.1");
        assert_ne!(ids[1], "_state.1");
        assert!(ids[1].starts_with("_state."));
        assert!(ids[2].starts_with("_final."));
    }

    #[test]
    fn test_ids_must_form_event_names() {
        let errors = build_err(json!({
            "states": [
                {"kind": "state", "id": "my work", "states": [{"kind": "final", "id": "f"}]},
                {"kind": "state", "id": "trailing.", "invoke": [{"id": "job..1", "type": "worker"}]},
                {"kind": "final", "id": "a.b"}
            ]
        }));
        assert!(errors.mentions("state[my work]"));
        assert!(errors.mentions("state[trailing.]"));
        assert!(errors.mentions("invoke id cannot name a done event"));
        assert!(!errors.mentions("final[a.b]"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_empty_and_unknown_datamodel() {
        let errors = build_err(json!({"states": []}));
        assert!(errors.mentions("document declares no states"));

        let errors = build_err(json!({
            "datamodel": "ecmascript",
            "states": [{"kind": "final", "id": "f"}]
        }));
        assert!(errors.mentions("unknown data model 'ecmascript'"));
    }

    #[test]
    fn test_null_datamodel_fails_closed() {
        let errors = build_err(json!({
            "datamodel": "null",
            "data": [{"id": "x", "expr": "1"}],
            "states": [
                {"kind": "state", "id": "s", "on_entry": [
                    {"action": "assign", "location": "x", "expr": "2"},
                    {"action": "script", "source": "x++"}
                ], "transitions": [{"cond": "In('s')", "target": "f"}]},
                {"kind": "final", "id": "f"}
            ]
        }));
        assert!(errors.mentions("does not support <data>"));
        assert!(errors.mentions("scxml/state[s]/onentry/action[0]"));
        assert!(errors.mentions("does not support scripts"));
        assert!(!errors.mentions("transition[0]/@cond"));
    }

    #[test]
    fn test_json_rejects_scripts() {
        let errors = build_err(json!({
            "script": {"source": "var x = 1;"},
            "states": [{"kind": "final", "id": "f"}]
        }));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.errors()[0].path, "scxml/script");
    }

    #[test]
    fn test_send_validation() {
        let errors = build_err(json!({
            "states": [
                {"kind": "state", "id": "s", "on_entry": [
                    {"action": "send", "event": "a", "eventexpr": "'b'"},
                    {"action": "send", "event": "t", "target": "#_internal", "delay": "1s"},
                    {"action": "send", "event": "d", "delay": "soon"},
                    {"action": "send", "event": "c", "namelist": ["x"], "content": {"body": 1}},
                    {"action": "cancel"}
                ]}
            ]
        }));
        assert!(errors.mentions("'event' and 'eventexpr' are mutually exclusive"));
        assert!(errors.mentions("delayed send to '#_internal'"));
        assert!(errors.mentions("invalid delay 'soon'"));
        assert!(errors.mentions("'content' is mutually exclusive"));
        assert!(errors.mentions("cancel requires"));
    }

    #[test]
    fn test_model_consistency_check() {
        let model = nested();
        let ok = Configuration::from_ids(&model, &["a", "a1"]).unwrap();
        assert!(ok.check_consistency(&model).is_ok());

        let orphan = Configuration::from_ids(&model, &["a1"]).unwrap();
        assert!(orphan.check_consistency(&model).is_err());

        let partial = Configuration::from_ids(&model, &["b", "b1"]).unwrap();
        assert!(partial.check_consistency(&model).is_err());

        let full = Configuration::from_ids(&model, &["b", "b1", "b2", "b2f"]).unwrap();
        assert!(full.check_consistency(&model).is_ok());
        assert!(model.is_in_final_state(7, &full));
        assert!(!model.is_in_final_state(5, &full));
        assert_eq!(full.atomic_states(&model), vec![6, 8]);

        assert!(Configuration::from_ids(&model, &["zzz"]).is_err());
    }
}
