//! Audit records and pre-merge snapshots.
//!
//! Every merge writes one [`AuditRecord`] and one [`EntitySnapshot`] per
//! absorbed entity, in the same transaction as the merge itself. Audit
//! records are immutable except for the rollback fields, which are set
//! exactly once. Snapshots are never modified or deleted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{RollbackError, ValidationError};
use crate::relationship::Relationship;

/// Store-assigned audit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(u64);

impl AuditId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned snapshot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one consolidation run, shared by all audits it wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// A fresh random run id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log entry describing one merge and its optional reversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Store-assigned id.
    pub id: AuditId,

    /// Run that performed the merge, if recorded.
    #[serde(default)]
    pub run_id: Option<RunId>,

    /// Kind of every merged entity.
    pub entity_type: EntityKind,

    /// Every entity absorbed by the merge (at least two).
    pub merged_entity_ids: Vec<EntityId>,

    /// The entity the merge produced.
    pub resulting_entity_id: EntityId,

    /// Member whose values won the merge; edges attached to the result after
    /// the merge are re-pointed here on rollback.
    pub canonical_member_id: EntityId,

    /// Weakest link score that joined the cluster.
    pub similarity_score: f64,

    /// When the merge committed.
    pub consolidation_timestamp: DateTime<Utc>,

    /// Set once the merge is rolled back.
    #[serde(default)]
    pub rollback_timestamp: Option<DateTime<Utc>>,

    /// Operator-supplied reason for the rollback.
    #[serde(default)]
    pub rollback_reason: Option<String>,

    /// Pre-merge state of every edge that touched a member.
    #[serde(default)]
    pub relationship_snapshots: Vec<Relationship>,
}

impl AuditRecord {
    /// Returns true once the merge has been undone.
    #[must_use]
    pub const fn is_rolled_back(&self) -> bool {
        self.rollback_timestamp.is_some()
    }

    /// Sets the rollback fields. They can only be set once.
    ///
    /// # Errors
    ///
    /// - `RollbackError::AlreadyRolledBack` if the fields are already set
    /// - `ValidationError::EmptyRollbackReason` (wrapped) for a blank reason
    pub fn mark_rolled_back(
        &mut self,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), crate::error::ConsolidationError> {
        if let Some(rolled_back_at) = self.rollback_timestamp {
            return Err(RollbackError::AlreadyRolledBack {
                audit_id: self.id,
                rolled_back_at,
            }
            .into());
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::EmptyRollbackReason.into());
        }
        self.rollback_timestamp = Some(at);
        self.rollback_reason = Some(reason.to_string());
        Ok(())
    }

    /// Returns true if this audit absorbed `entity_id`.
    #[must_use]
    pub fn absorbed(&self, entity_id: EntityId) -> bool {
        self.merged_entity_ids.contains(&entity_id)
    }
}

/// Immutable pre-merge copy of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Store-assigned id.
    pub id: SnapshotId,
    /// Kind of the captured entity.
    pub entity_type: EntityKind,
    /// Id the entity had before the merge.
    pub entity_id: EntityId,
    /// The entity exactly as it was stored.
    pub snapshot_data: Entity,
    /// The merge that took the snapshot.
    pub audit_id: AuditId,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Filter for listing audit records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditFilter {
    /// Only audits of this kind.
    pub entity_type: Option<EntityKind>,
    /// Only audits consolidated at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// Returns true if `audit` passes every set criterion.
    #[must_use]
    pub fn matches(&self, audit: &AuditRecord) -> bool {
        self.entity_type.map_or(true, |k| audit.entity_type == k)
            && self.since.map_or(true, |t| audit.consolidation_timestamp >= t)
    }
}
