//! Pre-merge capture and rollback.
//!
//! [`AuditAndSnapshotManager::begin_merge`] runs inside the merge
//! transaction: it snapshots every member exactly as stored and writes the
//! audit record, including the pre-merge state of every edge touching a
//! member. [`AuditAndSnapshotManager::rollback`] reverses one merge in the
//! caller's transaction; on any error nothing it did survives because the
//! transaction is dropped.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{AuditId, AuditRecord, EntitySnapshot, RunId};
use crate::entity::{EntityId, EntityKind, EntityRef};
use crate::error::{KcResult, RollbackError, ValidationError};
use crate::storage::{StorageError, Transaction};
use crate::time::Clock;

use super::rewrite::RelationshipRewriter;

/// Everything the audit trail needs to know about a merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    /// Kind of every member.
    pub kind: EntityKind,
    /// Stored members, each still live in the transaction.
    pub members: &'a [EntityId],
    /// The already stored merge result.
    pub result: EntityId,
    /// Member whose values won.
    pub canonical_member: EntityId,
    /// Weakest link score that joined the cluster.
    pub similarity_score: f64,
    /// Run performing the merge.
    pub run_id: Option<RunId>,
}

/// What a successful rollback changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    /// The audit that was rolled back.
    pub audit_id: AuditId,
    /// Members re-inserted from their snapshots, in audit order.
    pub restored: Vec<EntityId>,
    /// The merged entity that was deleted.
    pub removed: EntityId,
    /// Pre-merge edges put back.
    pub relationships_restored: usize,
    /// Edges added to the result after the merge, now on the canonical member.
    pub relationships_repointed: usize,
}

/// Writes audit records and snapshots; reverses merges.
#[derive(Clone)]
pub struct AuditAndSnapshotManager {
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AuditAndSnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditAndSnapshotManager").finish_non_exhaustive()
    }
}

impl AuditAndSnapshotManager {
    /// Creates a manager that stamps records with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Snapshots every member and inserts the audit record.
    ///
    /// Must run before any member is modified or deleted.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if a member is not live; `InvariantViolation` for
    /// fewer than two members.
    pub fn begin_merge(
        &self,
        tx: &mut Transaction<'_>,
        request: MergeRequest<'_>,
    ) -> Result<AuditId, StorageError> {
        if request.members.len() < 2 {
            return Err(StorageError::InvariantViolation(format!(
                "a merge into {} needs at least two members",
                EntityRef::new(request.kind, request.result)
            )));
        }
        let now = self.clock.now();
        let member_refs: Vec<EntityRef> = request
            .members
            .iter()
            .map(|id| EntityRef::new(request.kind, *id))
            .collect();

        let mut captured = Vec::with_capacity(member_refs.len());
        for member in &member_refs {
            let entity = tx
                .get(member.kind, member.id)
                .cloned()
                .ok_or(StorageError::EntityNotFound(*member))?;
            captured.push(entity);
        }

        let audit_id = tx.allocate_audit_id()?;
        tx.put_audit(AuditRecord {
            id: audit_id,
            run_id: request.run_id,
            entity_type: request.kind,
            merged_entity_ids: request.members.to_vec(),
            resulting_entity_id: request.result,
            canonical_member_id: request.canonical_member,
            similarity_score: request.similarity_score,
            consolidation_timestamp: now,
            rollback_timestamp: None,
            rollback_reason: None,
            relationship_snapshots: RelationshipRewriter::capture(tx, &member_refs),
        })?;

        for entity in captured {
            let id = tx.allocate_snapshot_id()?;
            tx.put_snapshot(EntitySnapshot {
                id,
                entity_type: request.kind,
                entity_id: entity.id,
                snapshot_data: entity,
                audit_id,
                created_at: now,
            })?;
        }

        debug!(audit = %audit_id, kind = %request.kind, members = request.members.len(), "merge audited");
        Ok(audit_id)
    }

    /// Reverses the merge recorded by `audit_id`.
    ///
    /// Preconditions are checked in order: the audit exists, it has not been
    /// rolled back, every member has a snapshot, no later live merge
    /// absorbed the result, and the result still exists. Then each member
    /// is re-inserted from its snapshot, the pre-merge edges whose original
    /// endpoints are all live again are restored, any other edge on the
    /// result moves to the canonical member, the result is deleted and the
    /// audit is marked.
    ///
    /// # Errors
    ///
    /// A [`RollbackError`] for a failed precondition, `EmptyRollbackReason`,
    /// or storage errors.
    pub fn rollback(
        &self,
        tx: &mut Transaction<'_>,
        audit_id: AuditId,
        reason: &str,
    ) -> KcResult<RollbackOutcome> {
        if reason.trim().is_empty() {
            return Err(ValidationError::EmptyRollbackReason.into());
        }
        let mut audit = tx
            .audit(audit_id)
            .cloned()
            .ok_or(RollbackError::AuditNotFound { audit_id })?;
        if let Some(rolled_back_at) = audit.rollback_timestamp {
            return Err(RollbackError::AlreadyRolledBack {
                audit_id,
                rolled_back_at,
            }
            .into());
        }

        let snapshots = tx.snapshots_for_audit(audit_id);
        let mut restore = Vec::with_capacity(audit.merged_entity_ids.len());
        for member in &audit.merged_entity_ids {
            let snapshot = snapshots
                .iter()
                .find(|s| s.entity_id == *member)
                .ok_or(RollbackError::MissingSnapshot {
                    audit_id,
                    entity_id: *member,
                })?;
            restore.push(snapshot.snapshot_data.clone());
        }

        let kind = audit.entity_type;
        let result = EntityRef::new(kind, audit.resulting_entity_id);
        if let Some(later) = tx
            .audits_absorbing(kind, result.id)
            .into_iter()
            .find(|a| a.id != audit_id && !a.is_rolled_back())
        {
            return Err(RollbackError::ConflictingLaterMerge {
                audit_id,
                resulting_entity_id: result.id,
                later_audit_id: later.id,
            }
            .into());
        }
        if !tx.is_live(result) {
            return Err(RollbackError::ResultMissing {
                audit_id,
                resulting_entity_id: result.id,
            }
            .into());
        }

        let mut restored = Vec::with_capacity(restore.len());
        for entity in restore {
            restored.push(tx.upsert(kind, entity)?);
        }

        let mut relationships_restored = 0;
        for original in &audit.relationship_snapshots {
            if !(tx.is_live(original.source) && tx.is_live(original.target)) {
                continue;
            }
            if tx.relationship(original.id).is_some() {
                tx.remove_relationship(original.id)?;
            }
            tx.put_relationship(original.clone())?;
            relationships_restored += 1;
        }

        let canonical = EntityRef::new(kind, audit.canonical_member_id);
        let report = RelationshipRewriter::rewrite(tx, &[result], canonical)?;
        tx.delete(kind, result.id)?;

        audit.mark_rolled_back(self.clock.now(), reason)?;
        tx.put_audit(audit)?;

        info!(
            audit = %audit_id,
            kind = %kind,
            restored = restored.len(),
            relationships_restored,
            "merge rolled back"
        );
        Ok(RollbackOutcome {
            audit_id,
            restored,
            removed: result.id,
            relationships_restored,
            relationships_repointed: report.repointed + report.deduplicated,
        })
    }
}
