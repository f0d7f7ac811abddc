//! Persistence bridge: checkpoints interpreter state so a session can resume
//! after a crash.

use crate::config::PersistenceLevel;
use crate::invoke::InvokeRecord;
use crate::scheduler::ScheduledSend;
use async_trait::async_trait;
use harel_model::Event;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("corrupt persisted state for '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value state of one session.
#[async_trait]
pub trait PersistenceContext: fmt::Debug + Send + Sync {
    async fn get_state(&self, key: &str) -> Result<Option<Value>, PersistenceError>;

    async fn set_state(&self, key: &str, value: Value) -> Result<(), PersistenceError>;

    async fn clear_state(&self, key: &str) -> Result<(), PersistenceError>;

    /// Makes everything written since the previous checkpoint durable.
    async fn check_point(&self, level: PersistenceLevel) -> Result<(), PersistenceError>;

    /// Drops history the store no longer needs.
    async fn shrink(&self) -> Result<(), PersistenceError>;
}

/// Hands out one context per session id.
pub trait PersistenceProvider: fmt::Debug + Send + Sync {
    fn context(&self, session_id: &str) -> Result<Arc<dyn PersistenceContext>, PersistenceError>;
}

pub mod keys {
    pub const CONFIGURATION: &str = "configuration";
    pub const HISTORY: &str = "history";
    pub const DATA_MODEL: &str = "data_model";
    pub const INTERNAL_QUEUE: &str = "internal_queue";
    pub const EXTERNAL_QUEUE: &str = "external_queue";
    pub const DELAYED_SENDS: &str = "delayed_sends";
    pub const STATES_TO_INVOKE: &str = "states_to_invoke";
    pub const INVOKES: &str = "invokes";
    pub const INITIALIZED_STATES: &str = "initialized_states";

    pub const ALL: [&str; 9] = [
        CONFIGURATION,
        HISTORY,
        DATA_MODEL,
        INTERNAL_QUEUE,
        EXTERNAL_QUEUE,
        DELAYED_SENDS,
        STATES_TO_INVOKE,
        INVOKES,
        INITIALIZED_STATES,
    ];
}

/// Everything needed to resume a session, keyed by state id so checkpoints
/// stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub configuration: Vec<String>,
    pub history: BTreeMap<String, Vec<String>>,
    pub data_model: Value,
    pub internal_queue: Vec<Event>,
    pub external_queue: Vec<Event>,
    pub delayed_sends: Vec<ScheduledSend>,
    pub states_to_invoke: Vec<String>,
    pub invokes: Vec<InvokeRecord>,
    pub initialized_states: Vec<String>,
}

impl SessionCheckpoint {
    /// Writes the checkpoint and commits it. `Minimal` leaves out the
    /// mid-macrostep keys.
    pub async fn write(
        &self,
        ctx: &dyn PersistenceContext,
        level: PersistenceLevel,
    ) -> Result<(), PersistenceError> {
        if level == PersistenceLevel::None {
            return Ok(());
        }

        ctx.set_state(keys::CONFIGURATION, serde_json::to_value(&self.configuration)?)
            .await?;
        ctx.set_state(keys::HISTORY, serde_json::to_value(&self.history)?)
            .await?;
        ctx.set_state(keys::DATA_MODEL, self.data_model.clone()).await?;
        ctx.set_state(keys::EXTERNAL_QUEUE, serde_json::to_value(&self.external_queue)?)
            .await?;
        ctx.set_state(keys::DELAYED_SENDS, serde_json::to_value(&self.delayed_sends)?)
            .await?;
        ctx.set_state(keys::INVOKES, serde_json::to_value(&self.invokes)?)
            .await?;
        ctx.set_state(
            keys::INITIALIZED_STATES,
            serde_json::to_value(&self.initialized_states)?,
        )
        .await?;

        if level == PersistenceLevel::Full {
            ctx.set_state(keys::INTERNAL_QUEUE, serde_json::to_value(&self.internal_queue)?)
                .await?;
            ctx.set_state(
                keys::STATES_TO_INVOKE,
                serde_json::to_value(&self.states_to_invoke)?,
            )
            .await?;
        } else {
            ctx.clear_state(keys::INTERNAL_QUEUE).await?;
            ctx.clear_state(keys::STATES_TO_INVOKE).await?;
        }

        ctx.check_point(level).await
    }

    /// Reads a checkpoint; `None` when the session was never checkpointed.
    pub async fn read(ctx: &dyn PersistenceContext) -> Result<Option<Self>, PersistenceError> {
        let Some(configuration) = ctx.get_state(keys::CONFIGURATION).await? else {
            return Ok(None);
        };

        Ok(Some(Self {
            configuration: decode(keys::CONFIGURATION, configuration)?,
            history: read_key(ctx, keys::HISTORY).await?,
            data_model: ctx.get_state(keys::DATA_MODEL).await?.unwrap_or(Value::Null),
            internal_queue: read_key(ctx, keys::INTERNAL_QUEUE).await?,
            external_queue: read_key(ctx, keys::EXTERNAL_QUEUE).await?,
            delayed_sends: read_key(ctx, keys::DELAYED_SENDS).await?,
            states_to_invoke: read_key(ctx, keys::STATES_TO_INVOKE).await?,
            invokes: read_key(ctx, keys::INVOKES).await?,
            initialized_states: read_key(ctx, keys::INITIALIZED_STATES).await?,
        }))
    }

    /// Removes every key of the session and shrinks the store.
    pub async fn clear(ctx: &dyn PersistenceContext) -> Result<(), PersistenceError> {
        for key in keys::ALL {
            ctx.clear_state(key).await?;
        }
        ctx.check_point(PersistenceLevel::Minimal).await?;
        ctx.shrink().await
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, PersistenceError> {
    serde_json::from_value(value).map_err(|e| PersistenceError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

async fn read_key<T: DeserializeOwned + Default>(
    ctx: &dyn PersistenceContext,
    key: &str,
) -> Result<T, PersistenceError> {
    match ctx.get_state(key).await? {
        Some(value) => decode(key, value),
        None => Ok(T::default()),
    }
}
