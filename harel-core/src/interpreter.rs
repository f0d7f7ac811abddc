//! State-machine interpreter.
//!
//! One [`Interpreter`] drives one session: it owns the configuration, the
//! history values, the data model and the internal queue, and runs
//! macrosteps until the session reaches a top-level final state, is
//! cancelled or fails.
//!
//! Transition selection, exit and entry follow the W3C SCXML algorithm:
//!
//! 1. For each active atomic state in document order, the first enabled
//!    transition of the state or its nearest ancestor is selected.
//! 2. Transitions whose exit sets intersect conflict; a transition from a
//!    descendant source preempts the other, otherwise the earlier one wins.
//! 3. States are exited in reverse document order (history recorded first)
//!    and entered in document order.

use crate::cancel::{cancellable, CancelSignal, CancelSource};
use crate::communication::{
    EventSender, ExternalCommunication, InvokeData, LocalCommunication, SendStatus,
    INTERNAL_TARGET,
};
use crate::config::{InterpreterConfig, PersistenceLevel, UnhandledErrorBehavior};
use crate::error::{InterpreterError, SessionFault};
use crate::invoke::{InvokeController, InvokeRecord};
use crate::logger::{InterpreterLogger, TracingLogger};
use crate::persistence::{PersistenceContext, SessionCheckpoint};
use crate::queue::{ExternalQueue, InternalQueue, QueueError};
use crate::scheduler::DelayedSendScheduler;
use futures::future::{BoxFuture, FutureExt};
use harel_model::document::{Binding, HistoryType, TransitionType};
use harel_model::event::{parse_delay, SCXML_EVENT_PROCESSOR};
use harel_model::model::{Action, InvokeNode, SendAction, TransitionIndex};
use harel_model::{
    ActiveStates, ConditionEvaluator, Configuration, DataModel, EvaluationError, Event, EventName,
    EventType, ExecutionScope, InterpreterModel, OutgoingEvent, StateIndex, StateKind, ROOT,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ERROR_EXECUTION: &str = "error.execution";
const ERROR_COMMUNICATION: &str = "error.communication";
const ERROR_PLATFORM: &str = "error.platform";

/// Why a session stopped without reaching a final state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Fault(SessionFault),
}

/// Observable lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    /// Blocked on the external queue.
    Waiting,
    Processing,
    Final,
    Stopped(StopReason),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Final | SessionStatus::Stopped(_))
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Top-level final state reached; carries its done-data.
    Completed(Value),
    Stopped(StopReason),
}

/// Collaborators and settings of one session.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    pub config: InterpreterConfig,
    pub communication: Arc<dyn ExternalCommunication>,
    pub persistence: Option<Arc<dyn PersistenceContext>>,
    pub logger: Arc<dyn InterpreterLogger>,
    /// Start parameters; override same-named top-level data.
    pub params: Map<String, Value>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            config: InterpreterConfig::default(),
            communication: Arc::new(LocalCommunication),
            persistence: None,
            logger: Arc::new(TracingLogger),
            params: Map::new(),
        }
    }
}

impl InterpreterOptions {
    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_communication(mut self, communication: Arc<dyn ExternalCommunication>) -> Self {
        self.communication = communication;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceContext>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn InterpreterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }
}

/// Outside handle of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    queue: Arc<ExternalQueue>,
    scheduler: Arc<DelayedSendScheduler>,
    cancel: CancelSource,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Enqueues an external event without waiting for room.
    pub fn send(&self, event: Event) -> Result<(), QueueError> {
        self.queue.try_enqueue(event)
    }

    /// Enqueues an external event, waiting for room under `Block`.
    pub async fn send_async(&self, event: Event) -> Result<(), QueueError> {
        self.queue.enqueue(event).await
    }

    /// Cancels a pending delayed send. Unknown ids are a no-op.
    pub fn cancel_send(&self, send_id: &str) -> bool {
        self.scheduler.cancel(send_id)
    }

    /// Stops the session at its next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Waits until the status satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> SessionStatus
    where
        F: Fn(&SessionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|status| predicate(status)).await {
            return status.clone();
        }
        let status = rx.borrow().clone();
        status
    }

    /// Waits until the session blocks on its external queue or ends.
    pub async fn settled(&self) -> SessionStatus {
        self.wait_for(|s| matches!(s, SessionStatus::Waiting) || s.is_terminal())
            .await
    }
}

/// Recoverable action failures become error events; fatal ones stop the
/// session.
#[derive(Debug)]
enum ActionError {
    Raise {
        event: &'static str,
        message: String,
        send_id: Option<String>,
    },
    Fatal(InterpreterError),
}

impl ActionError {
    fn execution(message: impl Into<String>) -> Self {
        ActionError::Raise {
            event: ERROR_EXECUTION,
            message: message.into(),
            send_id: None,
        }
    }

    fn communication(message: impl Into<String>) -> Self {
        ActionError::Raise {
            event: ERROR_COMMUNICATION,
            message: message.into(),
            send_id: None,
        }
    }

    fn with_send_id(self, id: &str) -> Self {
        match self {
            ActionError::Raise { event, message, .. } => ActionError::Raise {
                event,
                message,
                send_id: Some(id.to_string()),
            },
            fatal => fatal,
        }
    }
}

impl From<EvaluationError> for ActionError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::Execution(message) => ActionError::execution(message),
            EvaluationError::Infrastructure(message) => {
                ActionError::Fatal(InterpreterError::Evaluator(message))
            }
        }
    }
}

/// Runs one session of an [`InterpreterModel`].
#[derive(Debug)]
pub struct Interpreter {
    model: Arc<InterpreterModel>,
    session_id: String,
    origin: String,
    config: InterpreterConfig,
    communication: Arc<dyn ExternalCommunication>,
    persistence: Option<Arc<dyn PersistenceContext>>,
    logger: Arc<dyn InterpreterLogger>,
    params: Map<String, Value>,
    restore: bool,

    configuration: Configuration,
    history: BTreeMap<StateIndex, Vec<StateIndex>>,
    data_model: DataModel,
    internal: InternalQueue,
    external: Arc<ExternalQueue>,
    scheduler: Arc<DelayedSendScheduler>,
    invokes: InvokeController,
    states_to_invoke: BTreeSet<StateIndex>,
    initialized: BTreeSet<StateIndex>,
    current_event: Option<String>,
    last_written: Option<SessionCheckpoint>,

    running: bool,
    stop: Option<StopReason>,
    cancel: CancelSignal,
    status: watch::Sender<SessionStatus>,
}

impl Interpreter {
    /// Creates a fresh session.
    pub fn new(
        model: Arc<InterpreterModel>,
        session_id: impl Into<String>,
        options: InterpreterOptions,
    ) -> (Self, SessionHandle) {
        Self::create(model, session_id.into(), options, false)
    }

    /// Creates a session that resumes from its last checkpoint.
    pub fn restore(
        model: Arc<InterpreterModel>,
        session_id: impl Into<String>,
        options: InterpreterOptions,
    ) -> (Self, SessionHandle) {
        Self::create(model, session_id.into(), options, true)
    }

    fn create(
        model: Arc<InterpreterModel>,
        session_id: String,
        options: InterpreterOptions,
        restore: bool,
    ) -> (Self, SessionHandle) {
        let external = Arc::new(ExternalQueue::new(
            options.config.capacity(),
            options.config.backpressure,
        ));
        let scheduler = Arc::new(DelayedSendScheduler::new(external.clone()));
        let cancel = CancelSource::new();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Created);

        let handle = SessionHandle {
            session_id: session_id.clone(),
            queue: external.clone(),
            scheduler: scheduler.clone(),
            cancel: cancel.clone(),
            status: status_rx,
        };

        let interpreter = Self {
            origin: format!("#_scxml_{}", session_id),
            session_id,
            config: options.config,
            invokes: InvokeController::new(options.communication.clone()),
            communication: options.communication,
            persistence: options.persistence,
            logger: options.logger,
            params: options.params,
            restore,
            configuration: Configuration::new(),
            history: BTreeMap::new(),
            data_model: DataModel::new(),
            internal: InternalQueue::new(),
            external,
            scheduler,
            states_to_invoke: BTreeSet::new(),
            initialized: BTreeSet::new(),
            current_event: None,
            last_written: None,
            running: false,
            stop: None,
            cancel: cancel.signal(),
            status: status_tx,
            model,
        };

        (interpreter, handle)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Runs the session to completion.
    pub async fn run(mut self) -> Result<SessionOutcome, InterpreterError> {
        let result = self.run_loop().await;
        self.shutdown(&result).await;
        result
    }

    async fn run_loop(&mut self) -> Result<SessionOutcome, InterpreterError> {
        let signal = self.cancel.clone();
        self.set_status(SessionStatus::Running);

        let started = if self.restore {
            cancellable(&signal, self.restore_checkpoint()).await
        } else {
            cancellable(&signal, self.start()).await
        };
        match started {
            Some(result) => result?,
            None => return Ok(SessionOutcome::Stopped(StopReason::Cancelled)),
        }

        loop {
            if self.running {
                match cancellable(&signal, self.macrostep()).await {
                    Some(result) => result?,
                    None => return Ok(SessionOutcome::Stopped(StopReason::Cancelled)),
                }
            }

            if !self.running {
                if let Some(reason) = self.stop.take() {
                    return Ok(SessionOutcome::Stopped(reason));
                }
                let done_data = match cancellable(&signal, self.exit_interpreter()).await {
                    Some(result) => result?,
                    None => return Ok(SessionOutcome::Stopped(StopReason::Cancelled)),
                };
                return Ok(SessionOutcome::Completed(done_data));
            }

            self.checkpoint(PersistenceLevel::Minimal).await?;
            self.set_status(SessionStatus::Waiting);

            let Some(event) = self.external.dequeue(&signal).await else {
                return Ok(SessionOutcome::Stopped(StopReason::Cancelled));
            };

            self.set_status(SessionStatus::Processing);
            match cancellable(&signal, self.process_external(event)).await {
                Some(result) => result?,
                None => return Ok(SessionOutcome::Stopped(StopReason::Cancelled)),
            }
        }
    }

    async fn shutdown(&mut self, result: &Result<SessionOutcome, InterpreterError>) {
        self.external.close();
        self.scheduler.cancel_all();
        self.invokes.cancel_all().await;

        let status = match result {
            Ok(SessionOutcome::Completed(_)) => {
                if let Some(ctx) = &self.persistence {
                    if let Err(e) = SessionCheckpoint::clear(ctx.as_ref()).await {
                        warn!("Failed to clear state of session {}: {}", self.session_id, e);
                    }
                }
                info!("Session {} completed", self.session_id);
                SessionStatus::Final
            }
            Ok(SessionOutcome::Stopped(reason)) => {
                info!("Session {} stopped: {:?}", self.session_id, reason);
                SessionStatus::Stopped(reason.clone())
            }
            Err(e) => {
                warn!("Session {} failed: {}", self.session_id, e);
                SessionStatus::Stopped(StopReason::Fault(SessionFault::from(e)))
            }
        };
        self.set_status(status);
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    // =========================================================================
    // Startup and restore
    // =========================================================================

    async fn start(&mut self) -> Result<(), InterpreterError> {
        info!("Starting session {} of {}", self.session_id, self.model.name());
        self.initialize_data_model().await?;

        let model = self.model.clone();
        let initial = model
            .initial_transition(ROOT)
            .ok_or_else(|| InterpreterError::Platform("document has no initial transition".into()))?
            .index;

        self.running = true;
        self.enter_states(&[initial]).await?;
        self.verify_configuration();
        self.checkpoint(PersistenceLevel::Full).await
    }

    async fn initialize_data_model(&mut self) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        self.data_model
            .set_system("_sessionid", Value::String(self.session_id.clone()));
        self.data_model
            .set_system("_name", Value::String(model.name().to_string()));
        self.data_model.set_system(
            "_ioprocessors",
            json!({ SCXML_EVENT_PROCESSOR: { "location": self.origin } }),
        );

        match model.binding() {
            Binding::Early => {
                for state in model.states() {
                    if !state.is_history() {
                        self.initialize_data(state.index).await?;
                    }
                }
            }
            Binding::Late => self.initialize_data(ROOT).await?,
        }

        for node in &model.root().data {
            if let Some(value) = self.params.get(&node.id) {
                self.data_model.declare(&node.id, value.clone());
            }
        }

        if let Some(script) = model.script() {
            let states = ActiveStates::new(&self.model, &self.configuration);
            let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
            let result = script.execute(&mut scope).await;
            if let Err(e) = result {
                self.fail_action(ActionError::from(e))?;
            }
        }
        Ok(())
    }

    /// Declares a state's `<data>`. A failed expression declares `null` and
    /// raises `error.execution`.
    async fn initialize_data(&mut self, index: StateIndex) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        for node in &model.state(index).data {
            let value = match &node.value {
                Some(source) => {
                    let states = ActiveStates::new(&self.model, &self.configuration);
                    let mut scope =
                        ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                    let result = source.evaluate(&mut scope).await;
                    match result {
                        Ok(value) => value,
                        Err(e) => {
                            self.fail_action(ActionError::from(e))?;
                            Value::Null
                        }
                    }
                }
                None => Value::Null,
            };
            self.data_model.declare(&node.id, value);
        }
        self.initialized.insert(index);
        Ok(())
    }

    async fn restore_checkpoint(&mut self) -> Result<(), InterpreterError> {
        let ctx = self
            .persistence
            .clone()
            .ok_or_else(|| InterpreterError::Restore("no persistence context".into()))?;
        let checkpoint = SessionCheckpoint::read(ctx.as_ref()).await?.ok_or_else(|| {
            InterpreterError::Restore(format!("no checkpoint for session '{}'", self.session_id))
        })?;

        let model = self.model.clone();
        let configuration = Configuration::from_ids(&model, &checkpoint.configuration)
            .map_err(InterpreterError::Restore)?;
        if configuration.is_empty() {
            return Err(InterpreterError::Restore("empty configuration".into()));
        }
        configuration
            .check_consistency(&model)
            .map_err(InterpreterError::Restore)?;

        let mut history = BTreeMap::new();
        for (id, states) in &checkpoint.history {
            let index = resolve_index(&model, id)?;
            let recorded = states
                .iter()
                .map(|s| resolve_index(&model, s))
                .collect::<Result<Vec<_>, _>>()?;
            history.insert(index, recorded);
        }

        self.configuration = configuration;
        self.history = history;
        self.data_model =
            DataModel::restore(checkpoint.data_model).map_err(InterpreterError::Restore)?;
        self.internal = InternalQueue::from_events(checkpoint.internal_queue);
        self.external.restore(checkpoint.external_queue);
        self.scheduler.restore(checkpoint.delayed_sends);
        self.states_to_invoke = resolve_indices(&model, &checkpoint.states_to_invoke)?;
        self.initialized = resolve_indices(&model, &checkpoint.initialized_states)?;
        self.invokes.restore(checkpoint.invokes);
        self.running = true;

        info!(
            "Restored session {} in {:?}",
            self.session_id, checkpoint.configuration
        );
        Ok(())
    }

    // =========================================================================
    // Macrostep
    // =========================================================================

    async fn macrostep(&mut self) -> Result<(), InterpreterError> {
        loop {
            while self.running {
                let enabled = self.select_transitions(None).await?;
                if !enabled.is_empty() {
                    self.microstep(&enabled).await?;
                    self.checkpoint(PersistenceLevel::Full).await?;
                    continue;
                }

                let Some(event) = self.internal.dequeue() else {
                    break;
                };
                self.logger.event_processed(&self.session_id, &event);
                self.set_event(&event);

                let enabled = self.select_transitions(Some(&event)).await?;
                if enabled.is_empty() {
                    self.unhandled(&event)?;
                } else {
                    self.microstep(&enabled).await?;
                }
                self.checkpoint(PersistenceLevel::Full).await?;
            }

            if !self.running {
                return Ok(());
            }

            self.start_invokes().await?;
            if self.internal.is_empty() {
                return Ok(());
            }
        }
    }

    async fn process_external(&mut self, event: Event) -> Result<(), InterpreterError> {
        self.logger.event_processed(&self.session_id, &event);

        if let Some(invoke_id) = event.invoke_id.clone() {
            let Some(record) = self.invokes.get(&invoke_id).cloned() else {
                debug!(
                    "Session {} discarding {} from inactive invoke {}",
                    self.session_id, event.name, invoke_id
                );
                return Ok(());
            };

            self.set_event(&event);
            self.run_finalize(&record).await?;
            if event.name.as_str() == format!("done.invoke.{}", invoke_id) {
                self.invokes.complete(&invoke_id);
            }
        } else {
            self.set_event(&event);
        }

        for (invoke_id, e) in self.invokes.autoforward(&event).await {
            self.raise_error(
                ERROR_COMMUNICATION,
                format!("autoforward to '{}' failed: {}", invoke_id, e),
                None,
            );
        }

        let enabled = self.select_transitions(Some(&event)).await?;
        if enabled.is_empty() {
            self.unhandled(&event)?;
        } else {
            self.microstep(&enabled).await?;
        }
        self.checkpoint(PersistenceLevel::Full).await
    }

    async fn run_finalize(&mut self, record: &InvokeRecord) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let Some(invoke) = model
            .state_by_id(&record.state_id)
            .and_then(|state| state.invokes.get(record.position))
        else {
            return Ok(());
        };
        self.execute_block(&invoke.finalize).await
    }

    fn set_event(&mut self, event: &Event) {
        self.current_event = Some(event.name.as_str().to_string());
        self.data_model
            .set_system("_event", event.to_system_variable());
    }

    /// Applies the configured behavior to an `error.*` event no transition
    /// consumed.
    fn unhandled(&mut self, event: &Event) -> Result<(), InterpreterError> {
        if !event.name.is_error() {
            return Ok(());
        }
        let message = event
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match self.config.unhandled_error {
            UnhandledErrorBehavior::Ignore => {
                warn!(
                    "Session {} ignoring unhandled {}: {}",
                    self.session_id, event.name, message
                );
                Ok(())
            }
            UnhandledErrorBehavior::DestroyStateMachine => {
                warn!("Destroying session {} on unhandled {}", self.session_id, event.name);
                self.running = false;
                self.stop = Some(StopReason::Fault(SessionFault::new(
                    event.name.as_str(),
                    message,
                )));
                Ok(())
            }
            UnhandledErrorBehavior::RethrowException => Err(InterpreterError::UnhandledError {
                event: event.name.as_str().to_string(),
                message,
            }),
        }
    }

    // =========================================================================
    // Transition selection
    // =========================================================================

    /// Optimal enabled transition set for `event`, or the eventless set.
    async fn select_transitions(
        &mut self,
        event: Option<&Event>,
    ) -> Result<Vec<TransitionIndex>, InterpreterError> {
        let model = self.model.clone();
        let mut enabled = Vec::new();

        for atomic in self.configuration.atomic_states(&model) {
            let lineage = std::iter::once(atomic).chain(model.proper_ancestors(atomic, Some(ROOT)));
            'lineage: for state in lineage {
                for &t in &model.state(state).transitions {
                    let transition = model.transition(t);
                    let matched = match event {
                        None => transition.is_eventless(),
                        Some(event) => transition.matches(&event.name),
                    };
                    if matched && self.condition_holds(transition.cond.as_ref()).await? {
                        if !enabled.contains(&t) {
                            enabled.push(t);
                        }
                        break 'lineage;
                    }
                }
            }
        }

        Ok(self.remove_conflicting(enabled))
    }

    /// A failing condition raises `error.execution` and counts as false.
    async fn condition_holds(
        &mut self,
        cond: Option<&Arc<dyn ConditionEvaluator>>,
    ) -> Result<bool, InterpreterError> {
        let Some(cond) = cond else {
            return Ok(true);
        };
        let states = ActiveStates::new(&self.model, &self.configuration);
        let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
        let result = cond.evaluate_boolean(&mut scope).await;
        match result {
            Ok(holds) => Ok(holds),
            Err(e) => {
                self.fail_action(ActionError::from(e))?;
                Ok(false)
            }
        }
    }

    fn remove_conflicting(&self, enabled: Vec<TransitionIndex>) -> Vec<TransitionIndex> {
        let model = &self.model;
        let mut filtered: Vec<(TransitionIndex, BTreeSet<StateIndex>)> = Vec::new();

        for t1 in enabled {
            let exit1 = self.exit_set(&[t1]);
            let source1 = model.transition(t1).source;
            let mut preempted = false;
            let mut to_remove = Vec::new();

            for (i, (t2, exit2)) in filtered.iter().enumerate() {
                if exit1.is_disjoint(exit2) {
                    continue;
                }
                if model.is_descendant(source1, model.transition(*t2).source) {
                    to_remove.push(i);
                } else {
                    preempted = true;
                    break;
                }
            }

            if !preempted {
                for i in to_remove.into_iter().rev() {
                    filtered.remove(i);
                }
                filtered.push((t1, exit1));
            }
        }

        filtered.into_iter().map(|(t, _)| t).collect()
    }

    /// Targets with history pseudostates replaced by their recorded or
    /// default states.
    fn effective_targets(&self, t: TransitionIndex) -> BTreeSet<StateIndex> {
        let mut targets = BTreeSet::new();
        self.collect_effective_targets(t, &mut targets);
        targets
    }

    fn collect_effective_targets(&self, t: TransitionIndex, targets: &mut BTreeSet<StateIndex>) {
        for &s in &self.model.transition(t).targets {
            match &self.model.state(s).kind {
                StateKind::History { default, .. } => match self.history.get(&s) {
                    Some(recorded) => targets.extend(recorded.iter().copied()),
                    None => self.collect_effective_targets(*default, targets),
                },
                _ => {
                    targets.insert(s);
                }
            }
        }
    }

    /// State whose descendants a transition exits and enters; `None` for
    /// targetless transitions.
    fn transition_domain(&self, t: TransitionIndex) -> Option<StateIndex> {
        let model = &self.model;
        let targets = self.effective_targets(t);
        if targets.is_empty() {
            return None;
        }

        let transition = model.transition(t);
        let source = transition.source;
        if transition.kind == TransitionType::Internal
            && model.state(source).is_compound()
            && targets.iter().all(|&s| model.is_descendant(s, source))
        {
            return Some(source);
        }

        targets
            .iter()
            .map(|&s| model.lcca(source, s))
            .min_by_key(|&anc| model.state(anc).depth)
    }

    fn exit_set(&self, transitions: &[TransitionIndex]) -> BTreeSet<StateIndex> {
        let mut set = BTreeSet::new();
        for &t in transitions {
            if let Some(domain) = self.transition_domain(t) {
                set.extend(
                    self.configuration
                        .iter()
                        .filter(|&s| self.model.is_descendant(s, domain)),
                );
            }
        }
        set
    }

    // =========================================================================
    // Microstep
    // =========================================================================

    async fn microstep(&mut self, enabled: &[TransitionIndex]) -> Result<(), InterpreterError> {
        debug!("Session {} microstep {:?}", self.session_id, enabled);
        self.exit_states(enabled).await?;

        let model = self.model.clone();
        for &t in enabled {
            let transition = model.transition(t);
            let targets: Vec<String> = transition
                .targets
                .iter()
                .map(|&s| model.state(s).id.clone())
                .collect();
            self.logger.transition(
                &self.session_id,
                &model.state(transition.source).id,
                &targets,
                self.current_event.as_deref(),
            );
            self.execute_block(&transition.actions).await?;
        }

        self.enter_states(enabled).await?;
        self.verify_configuration();
        Ok(())
    }

    fn verify_configuration(&mut self) {
        if let Err(e) = self.configuration.check_consistency(&self.model) {
            self.raise_error(ERROR_PLATFORM, format!("inconsistent configuration: {}", e), None);
        }
    }

    async fn exit_states(&mut self, enabled: &[TransitionIndex]) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let exit_set = self.exit_set(enabled);
        for s in &exit_set {
            self.states_to_invoke.remove(s);
        }

        for &s in &exit_set {
            for &h in &model.state(s).history {
                let StateKind::History { history_type, .. } = &model.state(h).kind else {
                    continue;
                };
                let recorded: Vec<StateIndex> = match history_type {
                    HistoryType::Deep => self
                        .configuration
                        .iter()
                        .filter(|&c| model.state(c).is_atomic() && model.is_descendant(c, s))
                        .collect(),
                    HistoryType::Shallow => self
                        .configuration
                        .iter()
                        .filter(|&c| model.state(c).parent == Some(s))
                        .collect(),
                };
                self.history.insert(h, recorded);
            }
        }

        for &s in exit_set.iter().rev() {
            self.exit_state(s).await?;
        }
        Ok(())
    }

    async fn exit_state(&mut self, s: StateIndex) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let state = model.state(s);
        self.execute_block(&state.on_exit).await?;
        for (invoke_id, e) in self.invokes.cancel_state(&state.id).await {
            self.raise_error(
                ERROR_COMMUNICATION,
                format!("failed to cancel invoke '{}': {}", invoke_id, e),
                None,
            );
        }
        self.configuration.remove(s);
        self.logger.state_exited(&self.session_id, &state.id);
        Ok(())
    }

    async fn enter_states(&mut self, enabled: &[TransitionIndex]) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let mut entry = EntrySet::default();
        for &t in enabled {
            for &s in &model.transition(t).targets {
                self.add_descendants(s, &mut entry);
            }
            let Some(domain) = self.transition_domain(t) else {
                continue;
            };
            for s in self.effective_targets(t) {
                self.add_ancestors(s, domain, &mut entry);
            }
        }

        for s in entry.states {
            let state = model.state(s);
            self.configuration.insert(s);
            self.states_to_invoke.insert(s);
            if model.binding() == Binding::Late && !self.initialized.contains(&s) {
                self.initialize_data(s).await?;
            }
            self.logger.state_entered(&self.session_id, &state.id);

            self.execute_block(&state.on_entry).await?;
            if entry.default_entry.contains(&s) {
                if let Some(initial) = model.initial_transition(s) {
                    self.execute_block(&initial.actions).await?;
                }
            }
            if let Some(&t) = entry.history_content.get(&s) {
                self.execute_block(&model.transition(t).actions).await?;
            }

            if state.is_final() {
                self.enter_final(s).await?;
            }
        }
        Ok(())
    }

    async fn enter_final(&mut self, s: StateIndex) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let Some(parent) = model.state(s).parent else {
            return Ok(());
        };
        if parent == ROOT {
            self.running = false;
            return Ok(());
        }

        let data = self.done_data(s).await?;
        self.raise_done(parent, data);

        if let Some(grandparent) = model.state(parent).parent {
            if grandparent != ROOT
                && model.state(grandparent).is_parallel()
                && model.is_in_final_state(grandparent, &self.configuration)
            {
                self.raise_done(grandparent, Value::Null);
            }
        }
        Ok(())
    }

    async fn done_data(&mut self, s: StateIndex) -> Result<Value, InterpreterError> {
        let model = self.model.clone();
        let StateKind::Final {
            done_data: Some(payload),
        } = &model.state(s).kind
        else {
            return Ok(Value::Null);
        };
        let states = ActiveStates::new(&self.model, &self.configuration);
        let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
        let result = payload.evaluate(&mut scope).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fail_action(ActionError::from(e))?;
                Ok(Value::Null)
            }
        }
    }

    fn raise_done(&mut self, state: StateIndex, data: Value) {
        let name = format!("done.state.{}", self.model.state(state).id);
        match EventName::parse(&name) {
            Ok(name) => {
                let event = Event::new(name, EventType::Platform).with_data(data);
                self.internal.enqueue(event);
            }
            Err(e) => warn!("Session {} cannot raise done event: {}", self.session_id, e),
        }
    }

    fn add_descendants(&self, s: StateIndex, entry: &mut EntrySet) {
        let model = &self.model;
        let state = model.state(s);
        match &state.kind {
            StateKind::History { default, .. } => {
                let parent = state.parent.unwrap_or(ROOT);
                match self.history.get(&s) {
                    Some(recorded) => {
                        for &r in recorded {
                            self.add_descendants(r, entry);
                        }
                        for &r in recorded {
                            self.add_ancestors(r, parent, entry);
                        }
                    }
                    None => {
                        entry.history_content.insert(parent, *default);
                        let targets = &model.transition(*default).targets;
                        for &t in targets {
                            self.add_descendants(t, entry);
                        }
                        for &t in targets {
                            self.add_ancestors(t, parent, entry);
                        }
                    }
                }
            }
            StateKind::Compound { initial } => {
                entry.states.insert(s);
                entry.default_entry.insert(s);
                let targets = &model.transition(*initial).targets;
                for &t in targets {
                    self.add_descendants(t, entry);
                }
                for &t in targets {
                    self.add_ancestors(t, s, entry);
                }
            }
            StateKind::Parallel => {
                entry.states.insert(s);
                self.add_missing_regions(s, entry);
            }
            StateKind::Simple | StateKind::Final { .. } => {
                entry.states.insert(s);
            }
        }
    }

    fn add_ancestors(&self, s: StateIndex, ancestor: StateIndex, entry: &mut EntrySet) {
        for anc in self.model.proper_ancestors(s, Some(ancestor)) {
            if anc == ROOT {
                break;
            }
            entry.states.insert(anc);
            if self.model.state(anc).is_parallel() {
                self.add_missing_regions(anc, entry);
            }
        }
    }

    fn add_missing_regions(&self, parallel: StateIndex, entry: &mut EntrySet) {
        for &child in &self.model.state(parallel).children {
            let last = self.model.state(child).last_descendant;
            let covered = entry.states.range(child..=last).next().is_some();
            if !covered {
                self.add_descendants(child, entry);
            }
        }
    }

    /// Exits every active state after a top-level final state was entered and
    /// returns that state's done-data, evaluated after its on-exit handlers.
    async fn exit_interpreter(&mut self) -> Result<Value, InterpreterError> {
        let model = self.model.clone();
        let mut done_data = Value::Null;
        let active: Vec<StateIndex> = self.configuration.iter().rev().collect();
        for s in active {
            self.exit_state(s).await?;
            let state = model.state(s);
            if state.is_final() && state.parent == Some(ROOT) {
                done_data = self.done_data(s).await?;
            }
        }
        Ok(done_data)
    }

    // =========================================================================
    // Invokes
    // =========================================================================

    async fn start_invokes(&mut self) -> Result<(), InterpreterError> {
        let model = self.model.clone();
        let pending = std::mem::take(&mut self.states_to_invoke);
        for s in pending {
            for (position, invoke) in model.state(s).invokes.iter().enumerate() {
                if let Err(e) = self.start_invoke(s, position, invoke).await {
                    self.fail_action(e)?;
                }
            }
        }
        Ok(())
    }

    async fn start_invoke(
        &mut self,
        s: StateIndex,
        position: usize,
        invoke: &InvokeNode,
    ) -> Result<(), ActionError> {
        let model = self.model.clone();
        let state_id = &model.state(s).id;

        let states = ActiveStates::new(&self.model, &self.configuration);
        let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
        let invoke_id = match &invoke.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}.{}", state_id, Uuid::new_v4());
                if let Some(location) = &invoke.id_location {
                    location.set_value(&mut scope, Value::String(id.clone())).await?;
                }
                id
            }
        };
        let invoke_type = invoke.invoke_type.evaluate_string(&mut scope).await?;
        let source = match &invoke.src {
            Some(src) => Some(src.evaluate_string(&mut scope).await?),
            None => None,
        };
        let data = invoke.payload.evaluate(&mut scope).await?;

        let sender = EventSender::new(self.session_id.clone(), self.external.clone())
            .for_invoke(invoke_id.clone());
        let record = InvokeRecord {
            invoke_id: invoke_id.clone(),
            state_id: state_id.clone(),
            position,
            autoforward: invoke.autoforward,
        };
        let data = InvokeData {
            invoke_id: invoke_id.clone(),
            state_id: state_id.clone(),
            invoke_type,
            source,
            data,
            autoforward: invoke.autoforward,
            sender,
        };

        self.invokes.start(record, data).await.map_err(|e| {
            ActionError::communication(format!("failed to start invoke '{}': {}", invoke_id, e))
        })
    }

    // =========================================================================
    // Executable content
    // =========================================================================

    /// Runs an action block. A recoverable failure raises its error event
    /// and skips the rest of the block.
    async fn execute_block(&mut self, actions: &[Action]) -> Result<(), InterpreterError> {
        match self.run_actions(actions).await {
            Ok(()) => Ok(()),
            Err(e) => self.fail_action(e),
        }
    }

    fn fail_action(&mut self, err: ActionError) -> Result<(), InterpreterError> {
        match err {
            ActionError::Raise {
                event,
                message,
                send_id,
            } => {
                self.raise_error(event, message, send_id);
                Ok(())
            }
            ActionError::Fatal(e) => Err(e),
        }
    }

    fn raise_error(&mut self, name: &str, message: String, send_id: Option<String>) {
        self.logger.error(&self.session_id, name, &message);
        let mut data = json!({ "message": message });
        if let Some(id) = &send_id {
            data["sendid"] = Value::String(id.clone());
        }
        match Event::platform(name) {
            Ok(mut event) => {
                event.send_id = send_id;
                self.internal.enqueue(event.with_data(data));
            }
            Err(e) => warn!("Session {} cannot raise error event: {}", self.session_id, e),
        }
    }

    fn run_actions<'a>(&'a mut self, actions: &'a [Action]) -> BoxFuture<'a, Result<(), ActionError>> {
        async move {
            for action in actions {
                self.execute_action(action).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn execute_action(&mut self, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::Raise { event } => {
                self.internal.enqueue(Event::internal(event.clone()));
                Ok(())
            }
            Action::Send(send) => self.execute_send(send).await,
            Action::Cancel { send_id } => {
                let id = {
                    let states = ActiveStates::new(&self.model, &self.configuration);
                    let mut scope =
                        ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                    send_id.evaluate_string(&mut scope).await?
                };
                self.scheduler.cancel(&id);
                self.communication
                    .cancel_event(&id)
                    .await
                    .map_err(|e| ActionError::communication(e.to_string()).with_send_id(&id))
            }
            Action::Assign { location, value } => {
                let states = ActiveStates::new(&self.model, &self.configuration);
                let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                let value = value.evaluate(&mut scope).await?;
                location.set_value(&mut scope, value).await?;
                Ok(())
            }
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => {
                        let states = ActiveStates::new(&self.model, &self.configuration);
                        let mut scope =
                            ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                        expr.evaluate_object(&mut scope).await?
                    }
                    None => Value::Null,
                };
                self.logger.log(&self.session_id, label.as_deref(), &value);
                Ok(())
            }
            Action::If {
                branches,
                otherwise,
            } => {
                for branch in branches {
                    let holds = {
                        let states = ActiveStates::new(&self.model, &self.configuration);
                        let mut scope =
                            ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                        branch.cond.evaluate_boolean(&mut scope).await?
                    };
                    if holds {
                        return self.run_actions(&branch.actions).await;
                    }
                }
                self.run_actions(otherwise).await
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let items = {
                    let states = ActiveStates::new(&self.model, &self.configuration);
                    let mut scope =
                        ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                    match array.evaluate_object(&mut scope).await? {
                        Value::Array(items) => items,
                        other => {
                            return Err(ActionError::execution(format!(
                                "foreach array is not an array: {}",
                                other
                            )))
                        }
                    }
                };

                for (i, value) in items.into_iter().enumerate() {
                    {
                        let states = ActiveStates::new(&self.model, &self.configuration);
                        let mut scope =
                            ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                        if item.get_value(&mut scope).await.is_err() {
                            item.declare_local_variable(&mut scope).await?;
                        }
                        item.set_value(&mut scope, value).await?;
                        if let Some(index) = index {
                            if index.get_value(&mut scope).await.is_err() {
                                index.declare_local_variable(&mut scope).await?;
                            }
                            index.set_value(&mut scope, json!(i)).await?;
                        }
                    }
                    self.run_actions(actions).await?;
                }
                Ok(())
            }
            Action::Script(script) => {
                let states = ActiveStates::new(&self.model, &self.configuration);
                let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                script.execute(&mut scope).await?;
                Ok(())
            }
        }
    }

    async fn execute_send(&mut self, send: &SendAction) -> Result<(), ActionError> {
        let send_id = match &send.id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Some(location) = &send.id_location {
                    let states = ActiveStates::new(&self.model, &self.configuration);
                    let mut scope =
                        ExecutionScope::new(&self.session_id, &mut self.data_model, &states);
                    location.set_value(&mut scope, Value::String(id.clone())).await?;
                }
                id
            }
        };

        let outgoing = self
            .prepare_send(send, &send_id)
            .await
            .map_err(|e| e.with_send_id(&send_id))?;
        let delay = outgoing.delay;

        let status = self.communication.try_send_event(&outgoing).await;
        match status {
            Ok(SendStatus::Sent) => {
                debug!("Session {} sent {}", self.session_id, send_id);
                Ok(())
            }
            Ok(SendStatus::ToInternalQueue) if !delay.is_zero() => Err(ActionError::execution(
                format!("cannot delay a send to '{}'", INTERNAL_TARGET),
            )
            .with_send_id(&send_id)),
            Ok(SendStatus::ToInternalQueue) => {
                self.internal
                    .enqueue(outgoing.into_event(EventType::Internal));
                Ok(())
            }
            Ok(SendStatus::ToSchedule) => {
                let event = outgoing.into_event(EventType::External);
                self.scheduler.schedule(send_id, event, delay);
                Ok(())
            }
            Err(e) if e.is_execution() => {
                Err(ActionError::execution(e.to_string()).with_send_id(&send_id))
            }
            Err(e) => Err(ActionError::communication(e.to_string()).with_send_id(&send_id)),
        }
    }

    async fn prepare_send(
        &mut self,
        send: &SendAction,
        send_id: &str,
    ) -> Result<OutgoingEvent, ActionError> {
        let states = ActiveStates::new(&self.model, &self.configuration);
        let mut scope = ExecutionScope::new(&self.session_id, &mut self.data_model, &states);

        let name = match &send.event {
            Some(event) => event.evaluate_string(&mut scope).await?,
            None => return Err(ActionError::execution("send names no event")),
        };
        let name = EventName::parse(&name).map_err(|e| ActionError::execution(e.to_string()))?;

        let target = match &send.target {
            Some(target) => Some(target.evaluate_string(&mut scope).await?),
            None => None,
        };
        let event_type = match &send.send_type {
            Some(send_type) => Some(send_type.evaluate_string(&mut scope).await?),
            None => None,
        };
        let delay = match &send.delay {
            Some(delay) => {
                let text = delay.evaluate_string(&mut scope).await?;
                parse_delay(&text).map_err(|e| ActionError::execution(e.to_string()))?
            }
            None => Duration::ZERO,
        };
        let data = send.payload.evaluate(&mut scope).await?;

        Ok(OutgoingEvent {
            name,
            send_id: send_id.to_string(),
            target,
            event_type,
            delay,
            data,
            origin: self.origin.clone(),
        })
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Writes a checkpoint when the configured level covers `at` and the
    /// session changed since the last one written.
    async fn checkpoint(&mut self, at: PersistenceLevel) -> Result<(), InterpreterError> {
        let Some(ctx) = self.persistence.clone() else {
            return Ok(());
        };
        let level = self.config.persistence_level;
        if level == PersistenceLevel::None || level < at {
            return Ok(());
        }
        let snapshot = self.snapshot();
        if self.last_written.as_ref() == Some(&snapshot) {
            return Ok(());
        }
        snapshot.write(ctx.as_ref(), level).await?;
        self.last_written = Some(snapshot);
        Ok(())
    }

    /// Current session state keyed by state id.
    pub fn snapshot(&self) -> SessionCheckpoint {
        let model = &self.model;
        let ids = |set: &BTreeSet<StateIndex>| -> Vec<String> {
            set.iter().map(|&s| model.state(s).id.clone()).collect()
        };

        SessionCheckpoint {
            configuration: self.configuration.ids(model),
            history: self
                .history
                .iter()
                .map(|(&h, states)| {
                    (
                        model.state(h).id.clone(),
                        states.iter().map(|&s| model.state(s).id.clone()).collect(),
                    )
                })
                .collect(),
            data_model: self.data_model.snapshot(),
            internal_queue: self.internal.snapshot(),
            external_queue: self.external.snapshot(),
            delayed_sends: self.scheduler.pending(),
            states_to_invoke: ids(&self.states_to_invoke),
            invokes: self.invokes.records(),
            initialized_states: ids(&self.initialized),
        }
    }
}

/// States a microstep enters, with the bookkeeping of how they were reached.
#[derive(Debug, Default)]
struct EntrySet {
    states: BTreeSet<StateIndex>,
    default_entry: BTreeSet<StateIndex>,
    /// Parent of a defaulted history pseudostate -> default transition.
    history_content: HashMap<StateIndex, TransitionIndex>,
}

fn resolve_index(model: &InterpreterModel, id: &str) -> Result<StateIndex, InterpreterError> {
    model
        .index_of(id)
        .ok_or_else(|| InterpreterError::Restore(format!("unknown state '{}'", id)))
}

fn resolve_indices(
    model: &InterpreterModel,
    ids: &[String],
) -> Result<BTreeSet<StateIndex>, InterpreterError> {
    ids.iter().map(|id| resolve_index(model, id)).collect()
}
