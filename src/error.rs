//! Error types for the consolidation engine.
//!
//! All errors are strongly typed using thiserror. Callers can match on the
//! specific failure (an unknown entity type, a rollback precondition, a storage
//! invariant) instead of parsing messages.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::AuditId;
use crate::entity::{EntityId, EntityKind};
use crate::source::SourceId;
use crate::storage::StorageError;

/// An entity type string that is not part of the closed vocabulary.
///
/// This is the boundary where free-form type names coming from extraction
/// output or operators are turned into [`EntityKind`]. It is always fatal to
/// the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid entity type '{value}'")]
pub struct InvalidEntityTypeError {
    /// The rejected input, verbatim.
    pub value: String,
}

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A confidence outside `[0, 1]` or not finite.
    #[error("confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// A relationship strength outside `[0, 1]`.
    #[error("relationship strength {value} is out of range [0.0, 1.0]")]
    StrengthOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// The kind's matching field is missing or blank.
    #[error("primary field '{field}' of {kind} must be a non-empty string")]
    EmptyPrimaryField {
        /// Kind of the record.
        kind: EntityKind,
        /// The kind's primary field.
        field: &'static str,
    },

    /// A field the kind schema does not define.
    #[error("field '{field}' is not part of the {kind} schema")]
    UnknownField {
        /// Kind of the record.
        kind: EntityKind,
        /// The offending field name.
        field: String,
    },

    /// A list where a scalar was expected, or the other way round.
    #[error("field '{field}' of {kind} expects a {expected} value")]
    FieldShapeMismatch {
        /// Kind of the record.
        kind: EntityKind,
        /// The offending field name.
        field: String,
        /// Shape the schema declares.
        expected: &'static str,
    },

    /// A relation label that is not a lowercase identifier.
    #[error("invalid relation type '{value}'")]
    InvalidRelationType {
        /// The rejected label.
        value: String,
    },

    /// A source id that was never registered.
    #[error("source {id} is not registered")]
    UnknownSource {
        /// The unknown id.
        id: SourceId,
    },

    /// A source registered with a blank title.
    #[error("source title cannot be empty")]
    EmptySourceTitle,

    /// A rollback requested without a reason.
    #[error("rollback reason cannot be empty")]
    EmptyRollbackReason,

    /// Settings that failed [`ConsolidationConfig::validate`](crate::ConsolidationConfig::validate).
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}

/// Failures while computing the semantic half of a similarity score.
///
/// These never abort a consolidation run: the matcher logs them and falls back
/// to lexical-only scoring.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimilarityComputationError {
    /// The provider could not be reached or refused the call.
    #[error("embedding provider unavailable: {message}")]
    ProviderUnavailable {
        /// Provider-supplied detail.
        message: String,
    },

    /// The call did not return within the configured timeout.
    #[error("embedding call timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The provider returned a vector of the wrong length.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        /// Dimension the provider advertises.
        expected: usize,
        /// Length of the returned vector.
        actual: usize,
    },

    /// The background embedding thread has gone away.
    #[error("embedding worker disconnected")]
    WorkerDisconnected,
}

/// Rollback preconditions that were violated.
///
/// A rollback that fails with any of these performs no state change.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// No audit record with this id.
    #[error("audit record {audit_id} not found")]
    AuditNotFound {
        /// The requested audit.
        audit_id: AuditId,
    },

    /// The merge was already undone.
    #[error("audit record {audit_id} was already rolled back at {rolled_back_at}")]
    AlreadyRolledBack {
        /// The requested audit.
        audit_id: AuditId,
        /// When the earlier rollback happened.
        rolled_back_at: DateTime<Utc>,
    },

    /// A merged member has no pre-merge snapshot.
    #[error("audit record {audit_id} has no snapshot for merged entity {entity_id}")]
    MissingSnapshot {
        /// The requested audit.
        audit_id: AuditId,
        /// The member without a snapshot.
        entity_id: EntityId,
    },

    /// The merge result was itself merged by a later, still active audit.
    #[error(
        "entity {resulting_entity_id} produced by audit {audit_id} was merged again by audit {later_audit_id}; roll that back first"
    )]
    ConflictingLaterMerge {
        /// The requested audit.
        audit_id: AuditId,
        /// The entity the requested audit produced.
        resulting_entity_id: EntityId,
        /// The audit that absorbed it.
        later_audit_id: AuditId,
    },

    /// The merge result was deleted.
    #[error("entity {resulting_entity_id} produced by audit {audit_id} no longer exists")]
    ResultMissing {
        /// The requested audit.
        audit_id: AuditId,
        /// The entity the requested audit produced.
        resulting_entity_id: EntityId,
    },
}

/// Top-level error type for the consolidation engine.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// An entity type outside the vocabulary.
    #[error(transparent)]
    InvalidEntityType(#[from] InvalidEntityTypeError),

    /// Input that failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The store failed or refused a write.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A rollback precondition did not hold.
    #[error("rollback failed: {0}")]
    Rollback(#[from] RollbackError),

    /// Embedding failure surfaced to the caller.
    #[error("similarity computation failed: {0}")]
    Similarity(#[from] SimilarityComputationError),

    /// A broken internal assumption.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl ConsolidationError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the input named an unknown entity type.
    #[must_use]
    pub const fn is_invalid_entity_type(&self) -> bool {
        matches!(self, Self::InvalidEntityType(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a rollback precondition failure.
    #[must_use]
    pub const fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback(_))
    }

    /// Returns true if a rollback was refused because it already happened.
    #[must_use]
    pub const fn is_already_rolled_back(&self) -> bool {
        matches!(self, Self::Rollback(RollbackError::AlreadyRolledBack { .. }))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Similarity(SimilarityComputationError::Timeout { .. }) => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for consolidation operations.
pub type KcResult<T> = Result<T, ConsolidationError>;
