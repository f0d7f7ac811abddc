//! Session host.
//!
//! Keeps a registry of running sessions and a cache of built interpreter
//! models keyed by document checksum, so documents started many times are
//! validated once.

use crate::communication::{ExternalCommunication, LocalCommunication};
use crate::config::Config;
use crate::error::{InterpreterError, SessionFault};
use crate::interpreter::{
    Interpreter, InterpreterOptions, SessionHandle, SessionOutcome, SessionStatus, StopReason,
};
use crate::logger::{InterpreterLogger, TracingLogger};
use crate::persistence::PersistenceProvider;
use dashmap::DashMap;
use harel_model::{build, DataModelRegistry, Document, Event, InterpreterModel};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type SessionResult = Option<Result<Value, SessionFault>>;

struct SessionEntry {
    handle: SessionHandle,
    result: watch::Receiver<SessionResult>,
    task: JoinHandle<()>,
}

/// Runs statechart sessions as tokio tasks.
pub struct StateChartHost {
    config: Config,
    registry: DataModelRegistry,
    communication: Arc<dyn ExternalCommunication>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    logger: Arc<dyn InterpreterLogger>,
    models: DashMap<String, Arc<InterpreterModel>>,
    sessions: DashMap<String, SessionEntry>,
}

impl StateChartHost {
    pub fn new(config: Config) -> Self {
        let registry = DataModelRegistry::default().with_default(config.host.datamodel.clone());
        Self {
            config,
            registry,
            communication: Arc::new(LocalCommunication),
            persistence: None,
            logger: Arc::new(TracingLogger),
            models: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Replaces the data-model registry. The configured default name is kept.
    pub fn with_registry(mut self, registry: DataModelRegistry) -> Self {
        self.registry = registry.with_default(self.config.host.datamodel.clone());
        self
    }

    pub fn with_communication(mut self, communication: Arc<dyn ExternalCommunication>) -> Self {
        self.communication = communication;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceProvider>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn InterpreterLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds a document, reusing the cached model when its checksum was
    /// seen before.
    pub fn model(&self, document: &Document) -> Result<Arc<InterpreterModel>, InterpreterError> {
        let checksum = document.checksum()?;
        if let Some(model) = self.models.get(&checksum) {
            debug!("Using cached model {}", checksum);
            return Ok(model.clone());
        }

        let model = Arc::new(build(document, &self.registry)?);
        self.models.insert(checksum, model.clone());
        Ok(model)
    }

    pub fn cached_models(&self) -> usize {
        self.models.len()
    }

    pub fn start(
        &self,
        document: &Document,
        session_id: Option<String>,
        params: Map<String, Value>,
    ) -> Result<SessionHandle, InterpreterError> {
        let model = self.model(document)?;
        self.start_model(model, session_id, params)
    }

    /// Starts a session of a prebuilt model.
    pub fn start_model(
        &self,
        model: Arc<InterpreterModel>,
        session_id: Option<String>,
        params: Map<String, Value>,
    ) -> Result<SessionHandle, InterpreterError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.check_admission(&session_id)?;

        let options = self.options(&session_id)?.with_params(params);
        let (interpreter, handle) = Interpreter::new(model, session_id, options);
        self.spawn(interpreter, handle.clone());
        Ok(handle)
    }

    /// Resumes a session from its persisted state.
    pub fn resume(
        &self,
        document: &Document,
        session_id: &str,
    ) -> Result<SessionHandle, InterpreterError> {
        if self.persistence.is_none() {
            return Err(InterpreterError::Restore(
                "host has no persistence provider".to_string(),
            ));
        }
        let model = self.model(document)?;
        self.check_admission(session_id)?;

        let options = self.options(session_id)?;
        let (interpreter, handle) = Interpreter::restore(model, session_id, options);
        self.spawn(interpreter, handle.clone());
        Ok(handle)
    }

    fn check_admission(&self, session_id: &str) -> Result<(), InterpreterError> {
        if let Some(entry) = self.sessions.get(session_id) {
            if !entry.handle.status().is_terminal() {
                return Err(InterpreterError::SessionExists {
                    session_id: session_id.to_string(),
                });
            }
        }

        let max = self.config.host.max_sessions;
        if max > 0 && self.active_sessions() >= max {
            return Err(InterpreterError::SessionLimit { max });
        }
        Ok(())
    }

    fn options(&self, session_id: &str) -> Result<InterpreterOptions, InterpreterError> {
        let mut options = InterpreterOptions::default()
            .with_config(self.config.interpreter.clone())
            .with_communication(self.communication.clone())
            .with_logger(self.logger.clone());
        if let Some(provider) = &self.persistence {
            options = options.with_persistence(provider.context(session_id)?);
        }
        Ok(options)
    }

    fn spawn(&self, interpreter: Interpreter, handle: SessionHandle) {
        let session_id = handle.session_id().to_string();
        let (result_tx, result_rx) = watch::channel(None);

        let task_session = session_id.clone();
        let task = tokio::spawn(async move {
            let result = match interpreter.run().await {
                Ok(SessionOutcome::Completed(value)) => Ok(value),
                Ok(SessionOutcome::Stopped(StopReason::Cancelled)) => {
                    Err(SessionFault::new("CANCELLED", "session was stopped"))
                }
                Ok(SessionOutcome::Stopped(StopReason::Fault(fault))) => Err(fault),
                Err(e) => {
                    warn!("Session {} ended with error: {}", task_session, e);
                    Err(SessionFault::from(&e))
                }
            };
            result_tx.send_replace(Some(result));
        });

        info!("Session {} spawned", session_id);
        self.sessions.insert(
            session_id,
            SessionEntry {
                handle,
                result: result_rx,
                task,
            },
        );
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle, InterpreterError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| InterpreterError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Enqueues an external event without waiting.
    pub fn send(&self, session_id: &str, event: Event) -> Result<(), InterpreterError> {
        self.handle(session_id)?.send(event)?;
        Ok(())
    }

    /// Enqueues an external event, waiting for room when the queue blocks.
    pub async fn send_async(&self, session_id: &str, event: Event) -> Result<(), InterpreterError> {
        let handle = self.handle(session_id)?;
        handle.send_async(event).await?;
        Ok(())
    }

    pub fn cancel_send(&self, session_id: &str, send_id: &str) -> Result<bool, InterpreterError> {
        Ok(self.handle(session_id)?.cancel_send(send_id))
    }

    pub fn stop(&self, session_id: &str) -> Result<(), InterpreterError> {
        self.handle(session_id)?.stop();
        Ok(())
    }

    /// Waits for the session to end and returns its done-data.
    pub async fn result(&self, session_id: &str) -> Result<Value, SessionFault> {
        let mut rx = match self.sessions.get(session_id) {
            Some(entry) => entry.result.clone(),
            None => {
                let err = InterpreterError::SessionNotFound {
                    session_id: session_id.to_string(),
                };
                return Err(SessionFault::from(&err));
            }
        };

        if let Ok(result) = rx.wait_for(Option::is_some).await {
            if let Some(result) = result.clone() {
                return result;
            }
        }
        Err(SessionFault::new("ABORTED", "session task ended without a result"))
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|entry| entry.handle.status())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.handle.status().is_terminal())
            .count()
    }

    /// Drops a session from the registry, stopping it first if it is still
    /// running.
    pub fn forget(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, entry)) => {
                if !entry.handle.status().is_terminal() {
                    entry.handle.stop();
                }
                debug!("Session {} forgotten", session_id);
                true
            }
            None => false,
        }
    }

    /// Stops every session and waits for their tasks.
    pub async fn shutdown(&self) {
        let ids = self.session_ids();
        for id in &ids {
            if let Some((_, entry)) = self.sessions.remove(id) {
                entry.handle.stop();
                if let Err(e) = entry.task.await {
                    warn!("Session {} task panicked: {}", id, e);
                }
            }
        }
        info!("Host shut down ({} sessions)", ids.len());
    }
}

impl std::fmt::Debug for StateChartHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChartHost")
            .field("sessions", &self.sessions.len())
            .field("models", &self.models.len())
            .finish()
    }
}
