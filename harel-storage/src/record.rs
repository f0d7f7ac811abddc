//! Checkpoint record framing.
//!
//! Each record in a session's snapshot file has the following layout:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | level    | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | sequence            | payload (JSON object of persisted keys)   |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```

use crate::error::StorageError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use harel_core::PersistenceLevel;

/// Magic bytes for checkpoint records: "HSNP"
pub const RECORD_MAGIC: [u8; 4] = *b"HSNP";

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

fn level_to_u8(level: PersistenceLevel) -> u8 {
    match level {
        PersistenceLevel::None => 0,
        PersistenceLevel::Minimal => 1,
        PersistenceLevel::Full => 2,
    }
}

fn level_from_u8(value: u8, offset: u64) -> Result<PersistenceLevel, StorageError> {
    match value {
        0 => Ok(PersistenceLevel::None),
        1 => Ok(PersistenceLevel::Minimal),
        2 => Ok(PersistenceLevel::Full),
        _ => Err(StorageError::InvalidHeader {
            offset,
            reason: format!("unknown checkpoint level: {}", value),
        }),
    }
}

/// One committed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub level: PersistenceLevel,
    pub sequence: u64,
    pub crc32c: u32,
    pub payload: Bytes,
}

impl CheckpointRecord {
    pub fn new(level: PersistenceLevel, sequence: u64, payload: Bytes) -> Self {
        let crc = crc32c::crc32c(&payload);
        Self {
            level,
            sequence,
            crc32c: crc,
            payload,
        }
    }

    pub fn encode(&self) -> Result<BytesMut, StorageError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        buf.put_slice(&RECORD_MAGIC);
        buf.put_u8(level_to_u8(self.level));
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.crc32c);
        buf.put_u64(self.sequence);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes the next record. Returns `None` when the buffer holds less
    /// than a full record, which is how a torn trailing write looks.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, StorageError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0..4] != RECORD_MAGIC {
            return Err(StorageError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", &buf[0..4]),
            });
        }

        let level = level_from_u8(buf[4], offset)?;
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sequence = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(StorageError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StorageError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            level,
            sequence,
            crc32c: crc_expected,
            payload,
        }))
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}
