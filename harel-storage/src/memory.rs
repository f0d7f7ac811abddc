//! In-memory persistence.
//!
//! Writes are staged per session and only become visible to a fresh context
//! after `check_point`. [`MemoryStore::crash`] throws away everything that was
//! staged but never committed, which is what a process crash would lose.

use async_trait::async_trait;
use dashmap::DashMap;
use harel_core::{PersistenceContext, PersistenceError, PersistenceLevel, PersistenceProvider};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Process-local store. Cloning shares the underlying sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<DashMap<String, Arc<MemoryContext>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed keys of a session.
    pub fn committed(&self, session_id: &str) -> Option<BTreeMap<String, Value>> {
        self.sessions
            .get(session_id)
            .map(|ctx| ctx.committed.read().clone())
            .filter(|state| !state.is_empty())
    }

    /// Ids of sessions with committed state, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().committed.read().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Levels of every checkpoint taken by a session, oldest first.
    pub fn checkpoints(&self, session_id: &str) -> Vec<PersistenceLevel> {
        self.sessions
            .get(session_id)
            .map(|ctx| ctx.checkpoints.lock().clone())
            .unwrap_or_default()
    }

    /// Drops all uncommitted writes.
    pub fn crash(&self) {
        for entry in self.sessions.iter() {
            entry.value().staged.lock().clear();
        }
    }
}

impl PersistenceProvider for MemoryStore {
    fn context(&self, session_id: &str) -> Result<Arc<dyn PersistenceContext>, PersistenceError> {
        let ctx = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(MemoryContext::default()))
            .clone();
        Ok(ctx)
    }
}

/// One session's state inside a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct MemoryContext {
    committed: RwLock<BTreeMap<String, Value>>,
    /// `None` marks a pending removal.
    staged: Mutex<BTreeMap<String, Option<Value>>>,
    checkpoints: Mutex<Vec<PersistenceLevel>>,
}

#[async_trait]
impl PersistenceContext for MemoryContext {
    async fn get_state(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        if let Some(staged) = self.staged.lock().get(key) {
            return Ok(staged.clone());
        }
        Ok(self.committed.read().get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.staged.lock().insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn clear_state(&self, key: &str) -> Result<(), PersistenceError> {
        self.staged.lock().insert(key.to_string(), None);
        Ok(())
    }

    async fn check_point(&self, level: PersistenceLevel) -> Result<(), PersistenceError> {
        let staged = std::mem::take(&mut *self.staged.lock());
        let mut committed = self.committed.write();
        for (key, value) in staged {
            match value {
                Some(value) => {
                    committed.insert(key, value);
                }
                None => {
                    committed.remove(&key);
                }
            }
        }
        self.checkpoints.lock().push(level);
        Ok(())
    }

    async fn shrink(&self) -> Result<(), PersistenceError> {
        self.checkpoints.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_see_staged_writes() {
        let store = MemoryStore::new();
        let ctx = store.context("s1").unwrap();

        ctx.set_state("configuration", json!(["a"])).await.unwrap();
        assert_eq!(ctx.get_state("configuration").await.unwrap(), Some(json!(["a"])));
        assert!(store.committed("s1").is_none());

        ctx.check_point(PersistenceLevel::Full).await.unwrap();
        let committed = store.committed("s1").unwrap();
        assert_eq!(committed.get("configuration"), Some(&json!(["a"])));
        assert_eq!(store.checkpoints("s1"), vec![PersistenceLevel::Full]);
    }

    #[tokio::test]
    async fn test_crash_drops_uncommitted() {
        let store = MemoryStore::new();
        let ctx = store.context("s1").unwrap();

        ctx.set_state("data_model", json!({"x": 1})).await.unwrap();
        ctx.check_point(PersistenceLevel::Minimal).await.unwrap();
        ctx.set_state("data_model", json!({"x": 2})).await.unwrap();

        store.crash();

        let fresh = store.context("s1").unwrap();
        assert_eq!(fresh.get_state("data_model").await.unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_clear_is_committed_on_checkpoint() {
        let store = MemoryStore::new();
        let ctx = store.context("s1").unwrap();

        ctx.set_state("history", json!({})).await.unwrap();
        ctx.check_point(PersistenceLevel::Full).await.unwrap();
        assert_eq!(store.session_ids(), vec!["s1".to_string()]);

        ctx.clear_state("history").await.unwrap();
        assert_eq!(ctx.get_state("history").await.unwrap(), None);
        ctx.check_point(PersistenceLevel::Minimal).await.unwrap();
        ctx.shrink().await.unwrap();

        assert!(store.committed("s1").is_none());
        assert!(store.session_ids().is_empty());
        assert!(store.checkpoints("s1").is_empty());
    }

    #[tokio::test]
    async fn test_contexts_are_shared_per_session() {
        let store = MemoryStore::new();
        let a = store.context("s1").unwrap();
        a.set_state("k", json!(1)).await.unwrap();

        let b = store.context("s1").unwrap();
        assert_eq!(b.get_state("k").await.unwrap(), Some(json!(1)));

        let other = store.context("s2").unwrap();
        assert_eq!(other.get_state("k").await.unwrap(), None);
    }
}
