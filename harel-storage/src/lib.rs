//! # harel-storage
//!
//! Persistence contexts for harel sessions.
//!
//! This crate provides:
//! - [`MemoryStore`]: process-local checkpoints with staged writes
//! - [`SnapshotStore`]: crc32c-framed checkpoint files with an on-disk index

pub mod error;
pub mod memory;
pub mod record;
pub mod snapshot;

pub use error::StorageError;
pub use memory::{MemoryContext, MemoryStore};
pub use record::{CheckpointRecord, MAX_RECORD_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC};
pub use snapshot::{
    FileContext, LoadedSnapshot, SnapshotMeta, SnapshotStore, DEFAULT_COMPACT_AFTER,
};
