//! Keeps edges attached to live entities when their endpoints are merged.

use std::collections::BTreeMap;

use crate::entity::EntityRef;
use crate::relationship::Relationship;
use crate::storage::{StorageError, Transaction};

/// What a rewrite did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Edges moved to the new endpoint.
    pub repointed: usize,
    /// Edges folded into an existing edge with the same endpoints and type.
    pub deduplicated: usize,
    /// Edges that would have connected the result to itself.
    pub dropped_self_loops: usize,
}

/// Re-points, de-duplicates and prunes relationships.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationshipRewriter;

impl RelationshipRewriter {
    /// Every edge touching any of `members`, ascending by id.
    #[must_use]
    pub fn capture(tx: &Transaction<'_>, members: &[EntityRef]) -> Vec<Relationship> {
        let mut edges = BTreeMap::new();
        for member in members {
            for edge in tx.relationships_touching(*member) {
                edges.entry(edge.id).or_insert(edge);
            }
        }
        edges.into_values().collect()
    }

    /// Moves every edge touching `members` onto `result`.
    ///
    /// Edges that would become self-loops are removed. When the moved edge
    /// duplicates an existing one, the stronger edge survives and takes the
    /// union of both edges' sources.
    ///
    /// # Errors
    ///
    /// Storage errors from the transaction.
    pub fn rewrite(
        tx: &mut Transaction<'_>,
        members: &[EntityRef],
        result: EntityRef,
    ) -> Result<RewriteReport, StorageError> {
        let mut report = RewriteReport::default();
        let remap = |endpoint: EntityRef| {
            if members.contains(&endpoint) {
                result
            } else {
                endpoint
            }
        };

        for original in Self::capture(tx, members) {
            tx.remove_relationship(original.id)?;

            let mut moved = original;
            moved.source = remap(moved.source);
            moved.target = remap(moved.target);

            if moved.is_self_loop() {
                report.dropped_self_loops += 1;
                continue;
            }

            match tx.find_edge(&moved.key()) {
                Some(mut existing) => {
                    report.deduplicated += 1;
                    if moved.strength > existing.strength {
                        moved.mentioned_in_sources.extend(existing.mentioned_in_sources);
                        tx.remove_relationship(existing.id)?;
                        tx.put_relationship(moved)?;
                    } else {
                        existing.mentioned_in_sources.extend(moved.mentioned_in_sources);
                        tx.put_relationship(existing)?;
                    }
                }
                None => {
                    report.repointed += 1;
                    tx.put_relationship(moved)?;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityId, EntityKind};
    use crate::relationship::RelationshipId;
    use crate::source::{NewSource, SourceId};
    use crate::storage::EntityStore;
    use chrono::Utc;
    use std::collections::BTreeSet;

    struct Fixture {
        store: EntityStore,
        source: SourceId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = EntityStore::in_memory();
            let mut tx = store.begin().unwrap();
            let source = tx.allocate_source_id().unwrap();
            tx.put_source(NewSource::new("Interview").into_source(source, Utc::now()).unwrap())
                .unwrap();
            tx.commit().unwrap();
            Self { store, source }
        }

        fn add(&self, tx: &mut Transaction<'_>, kind: EntityKind, text: &str) -> EntityRef {
            let primary = kind.schema().primary;
            let e = Entity::mention(kind, self.source, 0.8, Utc::now()).with_field(primary, text);
            EntityRef::new(kind, tx.upsert(kind, e).unwrap())
        }
    }

    fn edge(
        tx: &mut Transaction<'_>,
        from: EntityRef,
        to: EntityRef,
        strength: f64,
        source: u64,
    ) -> RelationshipId {
        let id = tx.allocate_relationship_id().unwrap();
        tx.put_relationship(Relationship {
            id,
            source: from,
            target: to,
            relation_type: "caused_by".to_string(),
            strength,
            mentioned_in_sources: BTreeSet::from([SourceId::new(source)]),
        })
        .unwrap();
        id
    }

    #[test]
    fn test_repoint_dedup_and_self_loop() {
        let fx = Fixture::new();
        let mut tx = fx.store.begin().unwrap();
        let pain = fx.add(&mut tx, EntityKind::PainPoint, "manual reconciliation");
        let a = fx.add(&mut tx, EntityKind::System, "Excel");
        let b = fx.add(&mut tx, EntityKind::System, "Microsoft Excel");
        edge(&mut tx, pain, a, 0.4, 1);
        let strong = edge(&mut tx, pain, b, 0.9, 2);
        edge(&mut tx, a, b, 0.5, 1);

        let result = fx.add(&mut tx, EntityKind::System, "Excel");
        let report = RelationshipRewriter::rewrite(&mut tx, &[a, b], result).unwrap();
        assert_eq!(
            report,
            RewriteReport {
                repointed: 1,
                deduplicated: 1,
                dropped_self_loops: 1
            }
        );

        let remaining = tx.relationships_touching(result);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, strong);
        assert_eq!(remaining[0].strength, 0.9);
        assert_eq!(remaining[0].source, pain);
        assert_eq!(
            remaining[0].mentioned_in_sources,
            BTreeSet::from([SourceId::new(1), SourceId::new(2)])
        );
        assert!(tx.relationships_touching(a).is_empty());
        assert!(tx.relationships_touching(b).is_empty());

        tx.delete(EntityKind::System, a.id).unwrap();
        tx.delete(EntityKind::System, b.id).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_capture_is_unique_and_ordered() {
        let fx = Fixture::new();
        let mut tx = fx.store.begin().unwrap();
        let a = fx.add(&mut tx, EntityKind::System, "Excel");
        let b = fx.add(&mut tx, EntityKind::System, "Sheets");
        let first = edge(&mut tx, a, b, 0.5, 1);
        let second = edge(&mut tx, b, a, 0.5, 1);
        let captured = RelationshipRewriter::capture(&tx, &[a, b]);
        let ids: Vec<RelationshipId> = captured.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(EntityId::new(0), EntityId::UNASSIGNED);
    }
}
