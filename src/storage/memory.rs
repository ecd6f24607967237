//! The entity store.
//!
//! One `RwLock` guards the whole state. Reads take the shared lock briefly
//! and return owned copies; writes go through a [`Transaction`] that holds
//! the exclusive lock until it commits or is dropped.

use std::sync::{RwLock, RwLockReadGuard};

use crate::audit::{AuditFilter, AuditId, AuditRecord, EntitySnapshot};
use crate::entity::{Entity, EntityId, EntityKind, EntityRef};
use crate::relationship::{Relationship, RelationshipId};
use crate::source::{Source, SourceId};

use super::filter::EntityFilter;
use super::state::StoreState;
use super::traits::{CommitLog, NoopCommitLog, StorageError};
use super::transaction::Transaction;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Transactional store for entities, relationships, audits, snapshots and
/// sources.
pub struct EntityStore {
    state: RwLock<StoreState>,
    log: Box<dyn CommitLog>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore").finish_non_exhaustive()
    }
}

impl EntityStore {
    /// Creates an empty store that keeps nothing beyond process lifetime.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_log(Box::new(NoopCommitLog))
    }

    /// Creates an empty store whose commits are appended to `log`.
    #[must_use]
    pub fn with_log(log: Box<dyn CommitLog>) -> Self {
        Self::from_parts(StoreState::default(), log)
    }

    pub(crate) fn from_parts(state: StoreState, log: Box<dyn CommitLog>) -> Self {
        Self {
            state: RwLock::new(state),
            log,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StorageError> {
        self.state.read().map_err(|_| lock_err("store read"))
    }

    /// Opens a write transaction, blocking until no other one is open.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn begin(&self) -> Result<Transaction<'_>, StorageError> {
        let guard = self.state.write().map_err(|_| lock_err("store write"))?;
        Ok(Transaction::new(guard, self.log.as_ref()))
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Result<Option<Entity>, StorageError> {
        Ok(self.read()?.entity(EntityRef::new(kind, id)).cloned())
    }

    /// Entities of `kind` matching `filter`, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>, StorageError> {
        let state = self.read()?;
        let iter = state.entities(kind).filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn count(&self, kind: EntityKind) -> Result<usize, StorageError> {
        Ok(self.read()?.entity_count(kind))
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn relationship(&self, id: RelationshipId) -> Result<Option<Relationship>, StorageError> {
        Ok(self.read()?.relationship(id).cloned())
    }

    /// Every live edge, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn relationships(&self) -> Result<Vec<Relationship>, StorageError> {
        Ok(self.read()?.relationships().cloned().collect())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn relationships_touching(&self, entity: EntityRef) -> Result<Vec<Relationship>, StorageError> {
        Ok(self
            .read()?
            .relationships_touching(entity)
            .into_iter()
            .cloned()
            .collect())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn audit(&self, id: AuditId) -> Result<Option<AuditRecord>, StorageError> {
        Ok(self.read()?.audit(id).cloned())
    }

    /// Audits matching `filter`, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn audits(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StorageError> {
        Ok(self
            .read()?
            .audits()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn snapshots_for_audit(&self, audit: AuditId) -> Result<Vec<EntitySnapshot>, StorageError> {
        Ok(self
            .read()?
            .snapshots_for_audit(audit)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Most recent pre-merge snapshot of an entity.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn latest_snapshot(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> Result<Option<EntitySnapshot>, StorageError> {
        Ok(self.read()?.latest_snapshot(EntityRef::new(kind, id)).cloned())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn source(&self, id: SourceId) -> Result<Option<Source>, StorageError> {
        Ok(self.read()?.source(id).cloned())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn sources(&self) -> Result<Vec<Source>, StorageError> {
        Ok(self.read()?.sources().cloned().collect())
    }

    /// # Errors
    ///
    /// Returns `BackendError` if the lock is poisoned.
    pub fn source_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.source_count())
    }

    /// Collapses the commit log into a single checkpoint of the current
    /// state. A no-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Lock poisoning or commit-log I/O failures.
    pub fn compact(&self) -> Result<(), StorageError> {
        // Exclusive lock so no commit lands between the dump and the swap.
        let state = self.state.write().map_err(|_| lock_err("store compact"))?;
        self.log.checkpoint(&state.dump())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NewSource;
    use chrono::Utc;

    fn register(store: &EntityStore) -> SourceId {
        let mut tx = store.begin().unwrap();
        let id = tx.allocate_source_id().unwrap();
        tx.put_source(NewSource::new("Interview").into_source(id, Utc::now()).unwrap())
            .unwrap();
        tx.commit().unwrap();
        id
    }

    fn system(source: SourceId, name: &str) -> Entity {
        Entity::mention(EntityKind::System, source, 0.8, Utc::now()).with_field("name", name)
    }

    #[test]
    fn test_commit_publishes_and_drop_aborts() {
        let store = EntityStore::in_memory();
        let source = register(&store);

        let mut tx = store.begin().unwrap();
        let kept = tx.upsert(EntityKind::System, system(source, "Excel")).unwrap();
        tx.commit().unwrap();

        {
            let mut tx = store.begin().unwrap();
            tx.upsert(EntityKind::System, system(source, "SAP")).unwrap();
            tx.delete(EntityKind::System, kept).unwrap();
        }

        let all = store.list(EntityKind::System, &EntityFilter::all()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, kept);
    }

    #[test]
    fn test_ids_are_not_reused_after_abort() {
        let store = EntityStore::in_memory();
        let source = register(&store);

        let mut tx = store.begin().unwrap();
        let first = tx.upsert(EntityKind::System, system(source, "Excel")).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.delete(EntityKind::System, first).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let second = tx.upsert(EntityKind::System, system(source, "SAP")).unwrap();
        tx.commit().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_commit_rejects_unregistered_source() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        tx.upsert(EntityKind::System, system(SourceId::new(42), "Excel")).unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        assert_eq!(store.count(EntityKind::System).unwrap(), 0);
    }

    #[test]
    fn test_commit_rejects_dangling_edge() {
        let store = EntityStore::in_memory();
        let source = register(&store);

        let mut tx = store.begin().unwrap();
        let a = tx.upsert(EntityKind::System, system(source, "Excel")).unwrap();
        let b = tx.upsert(EntityKind::System, system(source, "SAP")).unwrap();
        let id = tx.allocate_relationship_id().unwrap();
        tx.put_relationship(Relationship {
            id,
            source: EntityRef::new(EntityKind::System, a),
            target: EntityRef::new(EntityKind::System, b),
            relation_type: "integrates_with".to_string(),
            strength: 0.5,
            mentioned_in_sources: [source].into(),
        })
        .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.delete(EntityKind::System, b).unwrap();
        assert!(matches!(tx.commit(), Err(StorageError::InvariantViolation(_))));

        assert!(store.get(EntityKind::System, b).unwrap().is_some());
        assert_eq!(store.relationships().unwrap().len(), 1);
    }

    #[test]
    fn test_kind_mismatch() {
        let store = EntityStore::in_memory();
        let source = register(&store);
        let mut tx = store.begin().unwrap();
        let err = tx.upsert(EntityKind::Kpi, system(source, "Excel")).unwrap_err();
        assert!(matches!(err, StorageError::KindMismatch { .. }));
    }
}
