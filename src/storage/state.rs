//! Raw store state and the mutations that change it.
//!
//! Every write goes through [`StoreState::apply`], which returns the inverse
//! mutation. Transactions keep those inverses as their undo log; the forward
//! mutations are the redo log handed to the [`CommitLog`](super::CommitLog).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditId, AuditRecord, EntitySnapshot, SnapshotId};
use crate::entity::{Entity, EntityId, EntityKind, EntityRef};
use crate::relationship::{Relationship, RelationshipId};
use crate::source::{Source, SourceId};

use super::traits::StorageError;

/// Id sequences. Values are the last id handed out; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    /// Entity ids, shared by every kind.
    Entity,
    /// Relationship ids.
    Relationship,
    /// Audit record ids.
    Audit,
    /// Snapshot ids.
    Snapshot,
    /// Source ids.
    Source,
}

impl SequenceKind {
    /// Every sequence.
    pub const ALL: [Self; 5] = [
        Self::Entity,
        Self::Relationship,
        Self::Audit,
        Self::Snapshot,
        Self::Source,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sequences {
    entity: u64,
    relationship: u64,
    audit: u64,
    snapshot: u64,
    source: u64,
}

impl Sequences {
    const fn get(&self, kind: SequenceKind) -> u64 {
        match kind {
            SequenceKind::Entity => self.entity,
            SequenceKind::Relationship => self.relationship,
            SequenceKind::Audit => self.audit,
            SequenceKind::Snapshot => self.snapshot,
            SequenceKind::Source => self.source,
        }
    }

    fn slot(&mut self, kind: SequenceKind) -> &mut u64 {
        match kind {
            SequenceKind::Entity => &mut self.entity,
            SequenceKind::Relationship => &mut self.relationship,
            SequenceKind::Audit => &mut self.audit,
            SequenceKind::Snapshot => &mut self.snapshot,
            SequenceKind::Source => &mut self.source,
        }
    }
}

/// A single row-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum Mutation {
    /// Insert or replace an entity row.
    PutEntity {
        /// The full row.
        entity: Entity,
    },
    /// Delete an entity row.
    RemoveEntity {
        /// The row to delete.
        entity: EntityRef,
    },
    /// Insert or replace an edge.
    PutRelationship {
        /// The full edge.
        relationship: Relationship,
    },
    /// Delete an edge.
    RemoveRelationship {
        /// The edge to delete.
        id: RelationshipId,
    },
    /// Insert or replace an audit record.
    PutAudit {
        /// The full record.
        audit: AuditRecord,
    },
    /// Delete an audit record.
    RemoveAudit {
        /// The record to delete.
        id: AuditId,
    },
    /// Insert a snapshot.
    PutSnapshot {
        /// The full snapshot.
        snapshot: EntitySnapshot,
    },
    /// Delete a snapshot.
    RemoveSnapshot {
        /// The snapshot to delete.
        id: SnapshotId,
    },
    /// Insert or replace a source.
    PutSource {
        /// The full source.
        source: Source,
    },
    /// Delete a source.
    RemoveSource {
        /// The source to delete.
        id: SourceId,
    },
    /// Move an id sequence.
    SetSequence {
        /// Which sequence.
        sequence: SequenceKind,
        /// The last id handed out.
        value: u64,
    },
}

/// Everything the store holds, plus secondary indexes.
#[derive(Debug, Default)]
pub struct StoreState {
    entities: BTreeMap<EntityKind, BTreeMap<EntityId, Entity>>,
    relationships: BTreeMap<RelationshipId, Relationship>,
    edges_by_entity: HashMap<EntityRef, BTreeSet<RelationshipId>>,
    audits: BTreeMap<AuditId, AuditRecord>,
    audits_by_member: HashMap<(EntityKind, EntityId), BTreeSet<AuditId>>,
    snapshots: BTreeMap<SnapshotId, EntitySnapshot>,
    snapshots_by_entity: HashMap<EntityRef, BTreeSet<SnapshotId>>,
    snapshots_by_audit: HashMap<AuditId, BTreeSet<SnapshotId>>,
    sources: BTreeMap<SourceId, Source>,
    sequences: Sequences,
}

impl StoreState {
    pub(crate) fn entity(&self, entity: EntityRef) -> Option<&Entity> {
        self.entities.get(&entity.kind).and_then(|m| m.get(&entity.id))
    }

    pub(crate) fn entities(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    pub(crate) fn entity_count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, BTreeMap::len)
    }

    pub(crate) fn is_live(&self, entity: EntityRef) -> bool {
        self.entity(entity).is_some()
    }

    pub(crate) fn relationship(&self, id: RelationshipId) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    pub(crate) fn relationships(&self) -> impl Iterator<Item = &Relationship> + '_ {
        self.relationships.values()
    }

    /// Edges with `entity` at either end, ascending by id.
    pub(crate) fn relationships_touching(&self, entity: EntityRef) -> Vec<&Relationship> {
        self.edges_by_entity
            .get(&entity)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relationships.get(id))
            .collect()
    }

    pub(crate) fn audit(&self, id: AuditId) -> Option<&AuditRecord> {
        self.audits.get(&id)
    }

    pub(crate) fn audits(&self) -> impl Iterator<Item = &AuditRecord> + '_ {
        self.audits.values()
    }

    /// Audits that listed `(kind, id)` among their merged entities.
    pub(crate) fn audits_absorbing(&self, kind: EntityKind, id: EntityId) -> Vec<&AuditRecord> {
        self.audits_by_member
            .get(&(kind, id))
            .into_iter()
            .flatten()
            .filter_map(|a| self.audits.get(a))
            .collect()
    }

    pub(crate) fn snapshots_for_audit(&self, audit: AuditId) -> Vec<&EntitySnapshot> {
        self.snapshots_by_audit
            .get(&audit)
            .into_iter()
            .flatten()
            .filter_map(|id| self.snapshots.get(id))
            .collect()
    }

    /// Most recent snapshot of `entity`, if any merge ever absorbed it.
    pub(crate) fn latest_snapshot(&self, entity: EntityRef) -> Option<&EntitySnapshot> {
        self.snapshots_by_entity
            .get(&entity)
            .and_then(|ids| ids.iter().next_back())
            .and_then(|id| self.snapshots.get(id))
    }

    pub(crate) fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    pub(crate) fn sources(&self) -> impl Iterator<Item = &Source> + '_ {
        self.sources.values()
    }

    pub(crate) fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub(crate) const fn sequence(&self, kind: SequenceKind) -> u64 {
        self.sequences.get(kind)
    }

    /// Applies one mutation and returns the mutation that undoes it.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when removing a row that does not exist.
    /// The state is unchanged on error.
    pub(crate) fn apply(&mut self, mutation: Mutation) -> Result<Mutation, StorageError> {
        match mutation {
            Mutation::PutEntity { entity } => {
                let key = entity.entity_ref();
                let previous = self
                    .entities
                    .entry(key.kind)
                    .or_default()
                    .insert(key.id, entity);
                Ok(previous.map_or(Mutation::RemoveEntity { entity: key }, |entity| {
                    Mutation::PutEntity { entity }
                }))
            }
            Mutation::RemoveEntity { entity: key } => {
                let previous = self
                    .entities
                    .get_mut(&key.kind)
                    .and_then(|m| m.remove(&key.id))
                    .ok_or(StorageError::EntityNotFound(key))?;
                Ok(Mutation::PutEntity { entity: previous })
            }
            Mutation::PutRelationship { relationship } => {
                let id = relationship.id;
                self.index_edge(&relationship);
                let previous = self.relationships.insert(id, relationship);
                if let Some(prev) = &previous {
                    self.unindex_edge(prev);
                    if let Some(current) = self.relationships.get(&id).cloned() {
                        self.index_edge(&current);
                    }
                }
                Ok(previous.map_or(Mutation::RemoveRelationship { id }, |relationship| {
                    Mutation::PutRelationship { relationship }
                }))
            }
            Mutation::RemoveRelationship { id } => {
                let previous = self
                    .relationships
                    .remove(&id)
                    .ok_or(StorageError::RelationshipNotFound(id))?;
                self.unindex_edge(&previous);
                Ok(Mutation::PutRelationship {
                    relationship: previous,
                })
            }
            Mutation::PutAudit { audit } => {
                let id = audit.id;
                for member in &audit.merged_entity_ids {
                    self.audits_by_member
                        .entry((audit.entity_type, *member))
                        .or_default()
                        .insert(id);
                }
                let previous = self.audits.insert(id, audit);
                if let Some(prev) = &previous {
                    let current = self.audits.get(&id).map(|a| a.merged_entity_ids.clone());
                    for member in &prev.merged_entity_ids {
                        if current.as_ref().map_or(true, |c| !c.contains(member)) {
                            self.unindex_audit_member(prev.entity_type, *member, id);
                        }
                    }
                }
                Ok(previous.map_or(Mutation::RemoveAudit { id }, |audit| Mutation::PutAudit {
                    audit,
                }))
            }
            Mutation::RemoveAudit { id } => {
                let previous = self
                    .audits
                    .remove(&id)
                    .ok_or(StorageError::AuditNotFound(id))?;
                for member in &previous.merged_entity_ids {
                    self.unindex_audit_member(previous.entity_type, *member, id);
                }
                Ok(Mutation::PutAudit { audit: previous })
            }
            Mutation::PutSnapshot { snapshot } => {
                let id = snapshot.id;
                if let Some(prev) = self.snapshots.remove(&id) {
                    self.unindex_snapshot(&prev);
                    self.index_snapshot(&snapshot);
                    self.snapshots.insert(id, snapshot);
                    return Ok(Mutation::PutSnapshot { snapshot: prev });
                }
                self.index_snapshot(&snapshot);
                self.snapshots.insert(id, snapshot);
                Ok(Mutation::RemoveSnapshot { id })
            }
            Mutation::RemoveSnapshot { id } => {
                let previous = self.snapshots.remove(&id).ok_or_else(|| {
                    StorageError::BackendError(format!("snapshot {id} not found"))
                })?;
                self.unindex_snapshot(&previous);
                Ok(Mutation::PutSnapshot { snapshot: previous })
            }
            Mutation::PutSource { source } => {
                let id = source.id;
                let previous = self.sources.insert(id, source);
                Ok(previous.map_or(Mutation::RemoveSource { id }, |source| {
                    Mutation::PutSource { source }
                }))
            }
            Mutation::RemoveSource { id } => {
                let previous = self.sources.remove(&id).ok_or_else(|| {
                    StorageError::BackendError(format!("source {id} not found"))
                })?;
                Ok(Mutation::PutSource { source: previous })
            }
            Mutation::SetSequence { sequence, value } => {
                let slot = self.sequences.slot(sequence);
                let previous = *slot;
                *slot = value;
                Ok(Mutation::SetSequence {
                    sequence,
                    value: previous,
                })
            }
        }
    }

    /// Mutations that rebuild this state from empty, in dependency order.
    pub(crate) fn dump(&self) -> Vec<Mutation> {
        let mut out = Vec::new();
        for sequence in SequenceKind::ALL {
            out.push(Mutation::SetSequence {
                sequence,
                value: self.sequences.get(sequence),
            });
        }
        out.extend(self.sources.values().cloned().map(|source| Mutation::PutSource { source }));
        out.extend(
            self.entities
                .values()
                .flat_map(BTreeMap::values)
                .cloned()
                .map(|entity| Mutation::PutEntity { entity }),
        );
        out.extend(
            self.relationships
                .values()
                .cloned()
                .map(|relationship| Mutation::PutRelationship { relationship }),
        );
        out.extend(self.audits.values().cloned().map(|audit| Mutation::PutAudit { audit }));
        out.extend(
            self.snapshots
                .values()
                .cloned()
                .map(|snapshot| Mutation::PutSnapshot { snapshot }),
        );
        out
    }

    fn index_edge(&mut self, edge: &Relationship) {
        self.edges_by_entity.entry(edge.source).or_default().insert(edge.id);
        self.edges_by_entity.entry(edge.target).or_default().insert(edge.id);
    }

    fn unindex_edge(&mut self, edge: &Relationship) {
        for endpoint in [edge.source, edge.target] {
            if let Some(ids) = self.edges_by_entity.get_mut(&endpoint) {
                ids.remove(&edge.id);
                if ids.is_empty() {
                    self.edges_by_entity.remove(&endpoint);
                }
            }
        }
    }

    fn unindex_audit_member(&mut self, kind: EntityKind, member: EntityId, audit: AuditId) {
        if let Some(ids) = self.audits_by_member.get_mut(&(kind, member)) {
            ids.remove(&audit);
            if ids.is_empty() {
                self.audits_by_member.remove(&(kind, member));
            }
        }
    }

    fn index_snapshot(&mut self, snapshot: &EntitySnapshot) {
        self.snapshots_by_entity
            .entry(EntityRef::new(snapshot.entity_type, snapshot.entity_id))
            .or_default()
            .insert(snapshot.id);
        self.snapshots_by_audit
            .entry(snapshot.audit_id)
            .or_default()
            .insert(snapshot.id);
    }

    fn unindex_snapshot(&mut self, snapshot: &EntitySnapshot) {
        let key = EntityRef::new(snapshot.entity_type, snapshot.entity_id);
        if let Some(ids) = self.snapshots_by_entity.get_mut(&key) {
            ids.remove(&snapshot.id);
            if ids.is_empty() {
                self.snapshots_by_entity.remove(&key);
            }
        }
        if let Some(ids) = self.snapshots_by_audit.get_mut(&snapshot.audit_id) {
            ids.remove(&snapshot.id);
            if ids.is_empty() {
                self.snapshots_by_audit.remove(&snapshot.audit_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use chrono::Utc;

    fn system(id: u64) -> Entity {
        let mut e = Entity::mention(EntityKind::System, SourceId::new(1), 0.8, Utc::now())
            .with_field("name", "Excel");
        e.id = EntityId::new(id);
        e
    }

    fn edge(id: u64, from: u64, to: u64) -> Relationship {
        Relationship {
            id: RelationshipId::new(id),
            source: EntityRef::new(EntityKind::System, EntityId::new(from)),
            target: EntityRef::new(EntityKind::System, EntityId::new(to)),
            relation_type: "integrates_with".to_string(),
            strength: 0.5,
            mentioned_in_sources: BTreeSet::new(),
        }
    }

    #[test]
    fn test_apply_returns_inverse() {
        let mut state = StoreState::default();
        let undo = state.apply(Mutation::PutEntity { entity: system(1) }).unwrap();
        assert!(state.is_live(EntityRef::new(EntityKind::System, EntityId::new(1))));

        state.apply(undo).unwrap();
        assert_eq!(state.entity_count(EntityKind::System), 0);
    }

    #[test]
    fn test_edge_index_follows_rewrites() {
        let mut state = StoreState::default();
        state.apply(Mutation::PutRelationship { relationship: edge(1, 1, 2) }).unwrap();
        let undo = state
            .apply(Mutation::PutRelationship { relationship: edge(1, 3, 2) })
            .unwrap();

        let one = EntityRef::new(EntityKind::System, EntityId::new(1));
        let three = EntityRef::new(EntityKind::System, EntityId::new(3));
        assert!(state.relationships_touching(one).is_empty());
        assert_eq!(state.relationships_touching(three).len(), 1);

        state.apply(undo).unwrap();
        assert_eq!(state.relationships_touching(one).len(), 1);
        assert!(state.relationships_touching(three).is_empty());
    }

    #[test]
    fn test_remove_missing_is_error_and_no_change() {
        let mut state = StoreState::default();
        let err = state
            .apply(Mutation::RemoveEntity {
                entity: EntityRef::new(EntityKind::System, EntityId::new(9)),
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound(_)));
    }

    #[test]
    fn test_dump_rebuilds_equal_state() {
        let mut state = StoreState::default();
        state
            .apply(Mutation::SetSequence { sequence: SequenceKind::Entity, value: 2 })
            .unwrap();
        state.apply(Mutation::PutEntity { entity: system(1) }).unwrap();
        state.apply(Mutation::PutEntity { entity: system(2) }).unwrap();
        state.apply(Mutation::PutRelationship { relationship: edge(1, 1, 2) }).unwrap();

        let mut rebuilt = StoreState::default();
        for m in state.dump() {
            rebuilt.apply(m).unwrap();
        }
        assert_eq!(rebuilt.dump(), state.dump());
        assert_eq!(rebuilt.sequence(SequenceKind::Entity), 2);
    }
}
