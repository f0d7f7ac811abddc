//! File-backed checkpoint storage.
//!
//! Every session owns one `<session_id>.snap` file. Each checkpoint appends a
//! framed record holding the full set of committed keys, so the newest valid
//! record is the session's state. Once a file holds `compact_after` records
//! the next checkpoint replaces it with a single record, and `shrink` does the
//! same on demand. An `index.json` next to the files tracks the latest record
//! of each session.

use crate::error::StorageError;
use crate::record::CheckpointRecord;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use harel_core::{PersistenceContext, PersistenceError, PersistenceLevel, PersistenceProvider};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Records a session file may hold before the next checkpoint compacts it.
pub const DEFAULT_COMPACT_AFTER: u64 = 64;

/// Index entry describing the latest checkpoint of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub session_id: String,
    pub sequence: u64,
    pub level: PersistenceLevel,
    pub records: u64,
    pub updated_at: i64,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Latest committed state of a session as read back from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedSnapshot {
    pub sequence: u64,
    pub records: u64,
    pub size_bytes: u64,
    pub state: BTreeMap<String, Value>,
}

/// Snapshot store for persisting session checkpoints.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    dir: PathBuf,
    index: RwLock<HashMap<String, SnapshotMeta>>,
    contexts: DashMap<String, Arc<FileContext>>,
    compact_after: u64,
}

impl SnapshotStore {
    /// Opens or creates a snapshot store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(dir, DEFAULT_COMPACT_AFTER)
    }

    /// Opens a store whose session files are compacted once they hold
    /// `compact_after` records.
    pub fn open_with(dir: impl AsRef<Path>, compact_after: u64) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let inner = StoreInner {
            dir,
            index: RwLock::new(HashMap::new()),
            contexts: DashMap::new(),
            compact_after: compact_after.max(1),
        };
        inner.load_index()?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Reads the newest valid checkpoint of a session from disk.
    pub fn load(&self, session_id: &str) -> Result<Option<LoadedSnapshot>, StorageError> {
        self.inner.load(session_id)
    }

    pub fn snapshot_meta(&self, session_id: &str) -> Option<SnapshotMeta> {
        self.inner.index.read().get(session_id).cloned()
    }

    /// Lists all snapshot metadata, ordered by session id.
    pub fn list_snapshots(&self) -> Vec<SnapshotMeta> {
        let mut metas: Vec<SnapshotMeta> = self.inner.index.read().values().cloned().collect();
        metas.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        metas
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.index.read().len()
    }

    /// Deletes a session's file and forgets any open context for it.
    pub fn delete(&self, session_id: &str) -> Result<(), StorageError> {
        let path = self.inner.snapshot_path(session_id)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.inner.contexts.remove(session_id);
        self.inner.index.write().remove(session_id);
        self.inner.save_index()
    }
}

impl PersistenceProvider for SnapshotStore {
    fn context(&self, session_id: &str) -> Result<Arc<dyn PersistenceContext>, PersistenceError> {
        if let Some(ctx) = self.inner.contexts.get(session_id) {
            return Ok(ctx.clone());
        }

        let loaded = self.inner.load(session_id)?.unwrap_or_default();
        self.inner.truncate_to(session_id, loaded.size_bytes)?;
        let ctx = Arc::new(FileContext {
            session_id: session_id.to_string(),
            store: self.inner.clone(),
            state: Mutex::new(FileState {
                committed: loaded.state,
                staged: BTreeMap::new(),
                sequence: loaded.sequence,
                records: loaded.records,
                size_bytes: loaded.size_bytes,
            }),
        });

        let ctx = self
            .inner
            .contexts
            .entry(session_id.to_string())
            .or_insert(ctx)
            .clone();
        Ok(ctx)
    }
}

impl StoreInner {
    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join("index.json");
        if !index_path.exists() {
            return Ok(());
        }

        let file = File::open(&index_path)?;
        let reader = BufReader::new(file);
        let index: HashMap<String, SnapshotMeta> = serde_json::from_reader(reader)?;
        *self.index.write() = index;

        Ok(())
    }

    fn save_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join("index.json");
        let file = File::create(&index_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &*self.index.read())?;
        Ok(())
    }

    fn snapshot_path(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        let valid = !session_id.is_empty()
            && session_id != "."
            && session_id != ".."
            && !session_id.contains(['/', '\\'])
            && session_id != "index.json";
        if !valid {
            return Err(StorageError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.snap", session_id)))
    }

    /// Atomically replaces a session file with `encoded`.
    fn replace_file(&self, path: &Path, encoded: &[u8]) -> Result<(), StorageError> {
        let tmp_path = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<LoadedSnapshot>, StorageError> {
        let path = self.snapshot_path(session_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        let mut buf = BytesMut::from(&data[..]);
        let mut offset = 0u64;
        let mut latest: Option<CheckpointRecord> = None;
        let mut records = 0u64;

        while let Some(record) = CheckpointRecord::decode(&mut buf, offset)? {
            offset += record.disk_size() as u64;
            records += 1;
            latest = Some(record);
        }

        if !buf.is_empty() {
            tracing::warn!(
                "Ignoring {} trailing bytes of incomplete checkpoint for session {}",
                buf.len(),
                session_id
            );
        }

        let Some(record) = latest else {
            return Ok(None);
        };
        let state: BTreeMap<String, Value> = serde_json::from_slice(&record.payload)?;

        Ok(Some(LoadedSnapshot {
            sequence: record.sequence,
            records,
            size_bytes: offset,
            state,
        }))
    }

    /// Cuts an incomplete trailing record so later appends stay readable.
    fn truncate_to(&self, session_id: &str, valid_len: u64) -> Result<(), StorageError> {
        let path = self.snapshot_path(session_id)?;
        if !path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::info!("Truncated session {} to {} bytes", session_id, valid_len);
        }
        Ok(())
    }

    fn update_index(&self, meta: Option<SnapshotMeta>, session_id: &str) -> Result<(), StorageError> {
        {
            let mut index = self.index.write();
            match meta {
                Some(meta) => {
                    index.insert(session_id.to_string(), meta);
                }
                None => {
                    index.remove(session_id);
                }
            }
        }
        self.save_index()
    }
}

#[derive(Debug)]
struct FileState {
    committed: BTreeMap<String, Value>,
    /// `None` marks a pending removal.
    staged: BTreeMap<String, Option<Value>>,
    sequence: u64,
    records: u64,
    size_bytes: u64,
}

/// Persistence context of one session inside a [`SnapshotStore`].
#[derive(Debug)]
pub struct FileContext {
    session_id: String,
    store: Arc<StoreInner>,
    state: Mutex<FileState>,
}

impl FileContext {
    fn meta(&self, state: &FileState, level: PersistenceLevel, crc: u32) -> SnapshotMeta {
        SnapshotMeta {
            session_id: self.session_id.clone(),
            sequence: state.sequence,
            level,
            records: state.records,
            updated_at: chrono::Utc::now().timestamp_millis(),
            size_bytes: state.size_bytes,
            checksum: format!("{:08x}", crc),
        }
    }

    fn commit(&self, level: PersistenceLevel) -> Result<(), StorageError> {
        let path = self.store.snapshot_path(&self.session_id)?;
        let mut state = self.state.lock();

        let staged = std::mem::take(&mut state.staged);
        for (key, value) in staged {
            match value {
                Some(value) => {
                    state.committed.insert(key, value);
                }
                None => {
                    state.committed.remove(&key);
                }
            }
        }

        let payload = Bytes::from(serde_json::to_vec(&state.committed)?);
        let record = CheckpointRecord::new(level, state.sequence + 1, payload);
        let encoded = record.encode()?;

        if state.records >= self.store.compact_after {
            self.store.replace_file(&path, &encoded)?;
            tracing::debug!(
                "Compacted session {} from {} records to 1",
                self.session_id,
                state.records
            );
            state.records = 1;
            state.size_bytes = encoded.len() as u64;
        } else {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            state.records += 1;
            state.size_bytes += encoded.len() as u64;
        }
        state.sequence = record.sequence;

        let meta = self.meta(&state, level, record.crc32c);
        drop(state);
        self.store.update_index(Some(meta), &self.session_id)?;

        tracing::debug!(
            "Checkpoint {} ({:?}) written for session {}",
            record.sequence,
            level,
            self.session_id
        );
        Ok(())
    }

    fn compact(&self) -> Result<(), StorageError> {
        let path = self.store.snapshot_path(&self.session_id)?;
        let mut state = self.state.lock();

        if state.committed.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            state.records = 0;
            state.size_bytes = 0;
            drop(state);
            self.store.update_index(None, &self.session_id)?;
            tracing::info!("Removed checkpoints of session {}", self.session_id);
            return Ok(());
        }

        if state.records <= 1 {
            return Ok(());
        }

        let level = self
            .store
            .index
            .read()
            .get(&self.session_id)
            .map(|meta| meta.level)
            .unwrap_or(PersistenceLevel::Full);
        let payload = Bytes::from(serde_json::to_vec(&state.committed)?);
        let record = CheckpointRecord::new(level, state.sequence, payload);
        let encoded = record.encode()?;
        self.store.replace_file(&path, &encoded)?;

        let previous = state.records;
        state.records = 1;
        state.size_bytes = encoded.len() as u64;
        let meta = self.meta(&state, level, record.crc32c);
        drop(state);
        self.store.update_index(Some(meta), &self.session_id)?;

        tracing::info!(
            "Compacted session {} from {} records to 1",
            self.session_id,
            previous
        );
        Ok(())
    }
}

#[async_trait]
impl PersistenceContext for FileContext {
    async fn get_state(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let state = self.state.lock();
        if let Some(staged) = state.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(state.committed.get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.state.lock().staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn clear_state(&self, key: &str) -> Result<(), PersistenceError> {
        self.state.lock().staged.insert(key.to_string(), None);
        Ok(())
    }

    async fn check_point(&self, level: PersistenceLevel) -> Result<(), PersistenceError> {
        if level == PersistenceLevel::None {
            return Ok(());
        }
        Ok(self.commit(level)?)
    }

    async fn shrink(&self) -> Result<(), PersistenceError> {
        Ok(self.compact()?)
    }
}
