//! Durable storage backend.
//!
//! The store keeps its full state in memory; durability comes from a
//! write-ahead log of committed batches:
//! - every commit is framed with a CRC32 checksum and appended before the
//!   commit returns
//! - a directory lock keeps a second process from opening the same data
//! - on open, the log is replayed up to the last intact record
//! - once the log passes `max_wal_size` it is replaced by a checkpoint
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   .lock         exclusive process lock
//!   commit.wal    header + commit / checkpoint records
//! ```

mod codec;
mod file_lock;
mod wal;

use file_lock::FileLock;
pub use wal::{Replay, WalRecord, WalRecordKind, WriteAheadLog};

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{KcResult, ValidationError};

use super::memory::EntityStore;
use super::state::{Mutation, StoreState};
use super::traits::{CommitLog, CommitRecord, StorageError};

/// File name of the commit log inside the database directory.
pub const WAL_FILE: &str = "commit.wal";

/// Configuration for persistent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Log size (bytes) that triggers a checkpoint after the next commit.
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    // Smaller logs would checkpoint on almost every commit.
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// # Errors
    ///
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// [`CommitLog`] backed by a [`WriteAheadLog`]. Owns the directory lock.
pub struct WalCommitLog {
    wal: WriteAheadLog,
    max_wal_size: u64,
    _lock: FileLock,
}

impl CommitLog for WalCommitLog {
    fn append(&self, record: &CommitRecord) -> Result<(), StorageError> {
        self.wal
            .append(WalRecordKind::Commit {
                mutations: record.mutations.clone(),
            })
            .map(|_| ())
            .map_err(|e| StorageError::BackendError(format!("commit log append failed: {e}")))
    }

    fn checkpoint(&self, state: &[Mutation]) -> Result<(), StorageError> {
        self.wal
            .checkpoint(state.to_vec())
            .map_err(|e| StorageError::BackendError(format!("commit log checkpoint failed: {e}")))
    }

    fn wants_checkpoint(&self) -> bool {
        self.wal.size_bytes().map_or(false, |size| size > self.max_wal_size)
    }
}

fn replay(records: Vec<WalRecord>) -> Result<StoreState, StorageError> {
    let mut state = StoreState::default();
    for record in records {
        let mutations = match record.kind {
            WalRecordKind::Checkpoint { mutations } => {
                state = StoreState::default();
                mutations
            }
            WalRecordKind::Commit { mutations } => mutations,
        };
        for mutation in mutations {
            state.apply(mutation).map_err(|e| {
                StorageError::SerializationError(format!(
                    "commit log record {} does not apply cleanly: {e}",
                    record.sequence
                ))
            })?;
        }
    }
    Ok(state)
}

/// Opens or creates a durable store in `dir`.
///
/// # Errors
///
/// - `InvalidConfig` for a bad configuration
/// - `StorageError::Locked` if another process holds the directory
/// - `StorageError::BackendError` for I/O failures
/// - `StorageError::SerializationError` if intact records do not replay
///
/// # Examples
///
/// ```rust,ignore
/// use kyro_consolidate::storage::persistent::open_store;
///
/// let store = open_store("./interviews.kc", None)?;
/// ```
pub fn open_store(dir: impl AsRef<Path>, config: Option<PersistentConfig>) -> KcResult<EntityStore> {
    let config = config.unwrap_or_default().validate()?;
    let dir = dir.as_ref();

    fs::create_dir_all(dir).map_err(|e| {
        StorageError::BackendError(format!("cannot create {}: {e}", dir.display()))
    })?;
    let lock = FileLock::acquire(dir)?;

    let (wal, found) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
        .map_err(|e| StorageError::BackendError(format!("cannot open commit log: {e}")))?;
    if found.truncated_bytes > 0 {
        warn!(bytes = found.truncated_bytes, "recovered from a torn commit log tail");
    }
    let records = found.records.len();
    let state = replay(found.records)?;
    info!(dir = %dir.display(), records, "persistent store opened");

    Ok(EntityStore::from_parts(
        state,
        Box::new(WalCommitLog {
            wal,
            max_wal_size: config.max_wal_size,
            _lock: lock,
        }),
    ))
}
