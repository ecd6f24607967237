//! Storage errors and the durability seam.
//!
//! The store itself is a single in-process structure; what varies between
//! deployments is where committed mutations go. [`CommitLog`] is that seam:
//! the in-memory store discards them, the persistent store appends them to a
//! write-ahead log before the commit is acknowledged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditId;
use crate::entity::{EntityKind, EntityRef};
use crate::relationship::RelationshipId;

use super::state::Mutation;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityRef),

    /// Relationship not found.
    #[error("Relationship not found: {0}")]
    RelationshipNotFound(RelationshipId),

    /// Audit record not found.
    #[error("Audit record not found: {0}")]
    AuditNotFound(AuditId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A row was written under the wrong kind.
    #[error("Kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// Kind of the table written to.
        expected: EntityKind,
        /// Kind carried by the row.
        actual: EntityKind,
    },

    /// A commit would have left the store inconsistent. Nothing was written.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Another process holds the database lock.
    #[error("Database locked: {0}")]
    Locked(String),
}

impl StorageError {
    /// Returns true if the same call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Locked(_) | Self::BackendError(_))
    }
}

/// The redo batch of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// When the transaction committed.
    pub committed_at: DateTime<Utc>,
    /// Changes in apply order.
    pub mutations: Vec<Mutation>,
}

/// Destination for committed mutations.
///
/// `append` runs while the store's write lock is held and before the commit
/// returns; a failed append aborts the transaction.
pub trait CommitLog: Send + Sync {
    /// Durably records one committed batch.
    ///
    /// # Errors
    ///
    /// Any error aborts the commit; the in-memory state is rolled back.
    fn append(&self, record: &CommitRecord) -> Result<(), StorageError>;

    /// Replaces the log with a single batch that rebuilds `state`.
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    fn checkpoint(&self, _state: &[Mutation]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Returns true when the log has grown enough that the next commit
    /// should be followed by a checkpoint.
    fn wants_checkpoint(&self) -> bool {
        false
    }
}

/// Commit log for purely in-memory stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommitLog;

impl CommitLog for NoopCommitLog {
    fn append(&self, _record: &CommitRecord) -> Result<(), StorageError> {
        Ok(())
    }
}
