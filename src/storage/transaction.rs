//! Write transactions.
//!
//! A [`Transaction`] holds the store's write lock for its whole lifetime, so
//! readers never observe a half-applied merge. Mutations are applied to the
//! live state immediately and their inverses are kept; dropping the
//! transaction without committing replays the inverses in reverse order.
//!
//! `commit` re-checks the store invariants on every row the transaction
//! touched before the batch is handed to the commit log. A violation aborts
//! the transaction.

use std::collections::BTreeSet;
use std::sync::RwLockWriteGuard;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::audit::{AuditFilter, AuditId, AuditRecord, EntitySnapshot, SnapshotId};
use crate::entity::{Entity, EntityId, EntityKind, EntityRef};
use crate::relationship::{EdgeKey, Relationship, RelationshipId};
use crate::source::{Source, SourceId};

use super::filter::EntityFilter;
use super::state::{Mutation, SequenceKind, StoreState};
use super::traits::{CommitLog, CommitRecord, StorageError};

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Number of mutations written.
    pub mutations: usize,
}

/// An open write transaction. See the module docs.
pub struct Transaction<'a> {
    state: RwLockWriteGuard<'a, StoreState>,
    log: &'a dyn CommitLog,
    undo: Vec<Mutation>,
    redo: Vec<Mutation>,
    touched_entities: BTreeSet<EntityRef>,
    touched_relationships: BTreeSet<RelationshipId>,
    touched_audits: BTreeSet<AuditId>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(state: RwLockWriteGuard<'a, StoreState>, log: &'a dyn CommitLog) -> Self {
        Self {
            state,
            log,
            undo: Vec::new(),
            redo: Vec::new(),
            touched_entities: BTreeSet::new(),
            touched_relationships: BTreeSet::new(),
            touched_audits: BTreeSet::new(),
            finished: false,
        }
    }

    fn record(&mut self, mutation: Mutation) -> Result<(), StorageError> {
        let forward = mutation.clone();
        let inverse = self.state.apply(mutation)?;
        self.undo.push(inverse);
        self.redo.push(forward);
        Ok(())
    }

    fn allocate(&mut self, sequence: SequenceKind) -> Result<u64, StorageError> {
        let next = self
            .state
            .sequence(sequence)
            .checked_add(1)
            .ok_or_else(|| StorageError::BackendError(format!("{sequence:?} sequence exhausted")))?;
        self.record(Mutation::SetSequence {
            sequence,
            value: next,
        })?;
        Ok(next)
    }

    // ---- reads ----

    /// Live entity as seen by this transaction.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<&Entity> {
        self.state.entity(EntityRef::new(kind, id))
    }

    /// Returns true if the entity exists.
    #[must_use]
    pub fn is_live(&self, entity: EntityRef) -> bool {
        self.state.is_live(entity)
    }

    /// Entities of `kind` passing `filter`, ascending by id.
    #[must_use]
    pub fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Vec<Entity> {
        let iter = self.state.entities(kind).filter(|e| filter.matches(e)).cloned();
        match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Edge by id.
    #[must_use]
    pub fn relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        self.state.relationship(id)
    }

    /// Every edge with `entity` at either end.
    #[must_use]
    pub fn relationships_touching(&self, entity: EntityRef) -> Vec<Relationship> {
        self.state
            .relationships_touching(entity)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Finds a live edge with the same endpoints and type.
    #[must_use]
    pub fn find_edge(&self, key: &EdgeKey) -> Option<Relationship> {
        self.state
            .relationships_touching(key.source)
            .into_iter()
            .find(|r| r.key() == *key)
            .cloned()
    }

    /// Audit record by id.
    #[must_use]
    pub fn audit(&self, id: AuditId) -> Option<&AuditRecord> {
        self.state.audit(id)
    }

    /// Audit records passing `filter`, ascending.
    #[must_use]
    pub fn audits(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        self.state.audits().filter(|a| filter.matches(a)).cloned().collect()
    }

    /// Audits that absorbed `(kind, id)`, ascending.
    #[must_use]
    pub fn audits_absorbing(&self, kind: EntityKind, id: EntityId) -> Vec<AuditRecord> {
        self.state.audits_absorbing(kind, id).into_iter().cloned().collect()
    }

    /// Snapshots taken by `audit`.
    #[must_use]
    pub fn snapshots_for_audit(&self, audit: AuditId) -> Vec<EntitySnapshot> {
        self.state.snapshots_for_audit(audit).into_iter().cloned().collect()
    }

    /// Source by id.
    #[must_use]
    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.state.source(id)
    }

    // ---- writes ----

    /// Inserts or replaces an entity. An unassigned id gets a fresh one.
    ///
    /// # Errors
    ///
    /// `KindMismatch` if `entity.kind` differs from `kind`.
    pub fn upsert(&mut self, kind: EntityKind, mut entity: Entity) -> Result<EntityId, StorageError> {
        if entity.kind != kind {
            return Err(StorageError::KindMismatch {
                expected: kind,
                actual: entity.kind,
            });
        }
        if entity.id.is_unassigned() {
            entity.id = EntityId::new(self.allocate(SequenceKind::Entity)?);
        }
        let id = entity.id;
        self.touched_entities.insert(entity.entity_ref());
        self.record(Mutation::PutEntity { entity })?;
        Ok(id)
    }

    /// Removes an entity and returns its last state.
    ///
    /// Edges are not touched; the caller must remove or re-point them before
    /// commit.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if the row does not exist.
    pub fn delete(&mut self, kind: EntityKind, id: EntityId) -> Result<Entity, StorageError> {
        let key = EntityRef::new(kind, id);
        let previous = self
            .state
            .entity(key)
            .cloned()
            .ok_or(StorageError::EntityNotFound(key))?;
        self.touched_entities.insert(key);
        self.record(Mutation::RemoveEntity { entity: key })?;
        Ok(previous)
    }

    /// Reserves a relationship id.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion.
    pub fn allocate_relationship_id(&mut self) -> Result<RelationshipId, StorageError> {
        Ok(RelationshipId::new(self.allocate(SequenceKind::Relationship)?))
    }

    /// Reserves an audit id.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion.
    pub fn allocate_audit_id(&mut self) -> Result<AuditId, StorageError> {
        Ok(AuditId::new(self.allocate(SequenceKind::Audit)?))
    }

    /// Reserves a snapshot id.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion.
    pub fn allocate_snapshot_id(&mut self) -> Result<SnapshotId, StorageError> {
        Ok(SnapshotId::new(self.allocate(SequenceKind::Snapshot)?))
    }

    /// Reserves a source id.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion.
    pub fn allocate_source_id(&mut self) -> Result<SourceId, StorageError> {
        Ok(SourceId::new(self.allocate(SequenceKind::Source)?))
    }

    /// Inserts or replaces an edge.
    ///
    /// # Errors
    ///
    /// Propagates state errors.
    pub fn put_relationship(&mut self, relationship: Relationship) -> Result<(), StorageError> {
        if let Some(previous) = self.state.relationship(relationship.id) {
            self.touched_entities.insert(previous.source);
            self.touched_entities.insert(previous.target);
        }
        self.touched_relationships.insert(relationship.id);
        self.record(Mutation::PutRelationship { relationship })
    }

    /// Removes an edge and returns it.
    ///
    /// # Errors
    ///
    /// `RelationshipNotFound` if it does not exist.
    pub fn remove_relationship(&mut self, id: RelationshipId) -> Result<Relationship, StorageError> {
        let previous = self
            .state
            .relationship(id)
            .cloned()
            .ok_or(StorageError::RelationshipNotFound(id))?;
        self.touched_relationships.insert(id);
        self.record(Mutation::RemoveRelationship { id })?;
        Ok(previous)
    }

    /// Inserts or replaces an audit record.
    ///
    /// # Errors
    ///
    /// Propagates state errors.
    pub fn put_audit(&mut self, audit: AuditRecord) -> Result<(), StorageError> {
        self.touched_audits.insert(audit.id);
        self.record(Mutation::PutAudit { audit })
    }

    /// Inserts a snapshot. Snapshots are write-once.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the id is already used.
    pub fn put_snapshot(&mut self, snapshot: EntitySnapshot) -> Result<(), StorageError> {
        if self
            .state
            .snapshots_for_audit(snapshot.audit_id)
            .iter()
            .any(|s| s.id == snapshot.id)
        {
            return Err(StorageError::DuplicateKey(format!("snapshot {}", snapshot.id)));
        }
        self.touched_audits.insert(snapshot.audit_id);
        self.record(Mutation::PutSnapshot { snapshot })
    }

    /// Inserts a source.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the id is already registered.
    pub fn put_source(&mut self, source: Source) -> Result<(), StorageError> {
        if self.state.source(source.id).is_some() {
            return Err(StorageError::DuplicateKey(format!("source {}", source.id)));
        }
        self.record(Mutation::PutSource { source })
    }

    // ---- completion ----

    fn check_invariants(&self) -> Result<(), StorageError> {
        for key in &self.touched_entities {
            match self.state.entity(*key) {
                Some(entity) => {
                    if entity.entity_ref() != *key {
                        return Err(StorageError::InvariantViolation(format!(
                            "row {key} stores {}",
                            entity.entity_ref()
                        )));
                    }
                    entity.check_invariants().map_err(StorageError::InvariantViolation)?;
                    if let Some(missing) = entity
                        .mentioned_in_sources
                        .iter()
                        .find(|s| self.state.source(**s).is_none())
                    {
                        return Err(StorageError::InvariantViolation(format!(
                            "{key} mentions unregistered source {missing}"
                        )));
                    }
                }
                None => {
                    if let Some(edge) = self.state.relationships_touching(*key).first() {
                        return Err(StorageError::InvariantViolation(format!(
                            "relationship {} still references removed entity {key}",
                            edge.id
                        )));
                    }
                }
            }
        }

        for id in &self.touched_relationships {
            if let Some(edge) = self.state.relationship(*id) {
                for endpoint in [edge.source, edge.target] {
                    if !self.state.is_live(endpoint) {
                        return Err(StorageError::InvariantViolation(format!(
                            "relationship {id} references missing entity {endpoint}"
                        )));
                    }
                }
            }
        }

        for id in &self.touched_audits {
            let Some(audit) = self.state.audit(*id) else {
                return Err(StorageError::InvariantViolation(format!(
                    "snapshot written for missing audit {id}"
                )));
            };
            if audit.merged_entity_ids.len() < 2 {
                return Err(StorageError::InvariantViolation(format!(
                    "audit {id} merged fewer than two entities"
                )));
            }
            if audit.rollback_timestamp.is_some() != audit.rollback_reason.is_some() {
                return Err(StorageError::InvariantViolation(format!(
                    "audit {id} has partial rollback fields"
                )));
            }
            let snapshots = self.state.snapshots_for_audit(*id);
            if let Some(missing) = audit
                .merged_entity_ids
                .iter()
                .find(|m| !snapshots.iter().any(|s| s.entity_id == **m))
            {
                return Err(StorageError::InvariantViolation(format!(
                    "audit {id} has no snapshot for merged entity {missing}"
                )));
            }
        }

        Ok(())
    }

    /// Validates invariants and publishes the batch.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` or a commit-log failure. Either way every
    /// mutation is undone before this returns.
    pub fn commit(mut self) -> Result<CommitSummary, StorageError> {
        if let Err(e) = self.check_invariants() {
            error!(error = %e, "commit rejected");
            return Err(e);
        }

        let mutations = self.redo.len();
        if mutations > 0 {
            let record = CommitRecord {
                committed_at: Utc::now(),
                mutations: std::mem::take(&mut self.redo),
            };
            self.log.append(&record)?;
        }

        self.finished = true;
        if mutations > 0 && self.log.wants_checkpoint() {
            // The batch is already durable; a failed checkpoint only leaves
            // a longer log behind.
            if let Err(e) = self.log.checkpoint(&self.state.dump()) {
                warn!(error = %e, "automatic checkpoint failed");
            }
        }
        debug!(mutations, "transaction committed");
        Ok(CommitSummary { mutations })
    }

    /// Discards every mutation made so far.
    pub fn abort(self) {
        drop(self);
    }

    fn rollback_in_place(&mut self) {
        while let Some(inverse) = self.undo.pop() {
            if let Err(e) = self.state.apply(inverse) {
                error!(error = %e, "undo step failed");
            }
        }
        self.redo.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if !self.undo.is_empty() {
                debug!(mutations = self.undo.len(), "transaction aborted");
            }
            self.rollback_in_place();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("pending", &self.redo.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
