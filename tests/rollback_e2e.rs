//! Rollback behaviour: round trips, ordering constraints, edge restoration.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use kyro_consolidate::consolidation::{AuditAndSnapshotManager, MergeRequest};
use kyro_consolidate::time::{Clock, ManualClock};
use kyro_consolidate::{
    AuditId, ConsolidationAgent, ConsolidationConfig, ConsolidationError, Entity, EntityId,
    EntityKind, EntityRef, EntityStore, ExtractedEntity, NewRelationship, NewSource,
    RollbackError, SourceId,
};

struct Harness {
    agent: ConsolidationAgent,
    clock: Arc<ManualClock>,
    sources: Vec<SourceId>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap()));
        let config = ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75);
        let agent = ConsolidationAgent::new(Arc::new(EntityStore::in_memory()), config)
            .unwrap()
            .with_clock(clock.clone());
        let sources = (1..=3)
            .map(|n| agent.register_source(NewSource::new(format!("Interview {n}"))).unwrap())
            .collect();
        Self {
            agent,
            clock,
            sources,
        }
    }

    fn system(&self, source: usize, name: &str) -> kyro_consolidate::ConsolidationResult {
        self.clock.advance(Duration::minutes(5));
        self.agent
            .consolidate(
                vec![ExtractedEntity::new("system").field("name", name)],
                self.sources[source],
            )
            .unwrap()
    }

    fn systems(&self) -> Vec<Entity> {
        self.agent
            .list_entities("system", &kyro_consolidate::EntityFilter::all())
            .unwrap()
    }
}

#[test]
fn rollback_restores_originals_and_refuses_a_second_time() {
    let h = Harness::new();
    let excel = h.system(0, "Excel").entities_of(EntityKind::System)[0].clone();
    let merge = h.system(1, "Microsoft Excel");
    let audit = merge.audits[0];
    let result = merge.entities_of(EntityKind::System)[0].id;
    let snapshots = h.agent.store().snapshots_for_audit(audit).unwrap();
    assert_eq!(snapshots.len(), 2);

    let outcome = h.agent.rollback(audit, "different products").unwrap();
    assert_eq!(outcome.removed, result);
    assert_eq!(outcome.restored.len(), 2);

    assert!(h.agent.get_entity("system", result).unwrap().is_none());
    let live = h.systems();
    assert_eq!(live.len(), 2);
    for snapshot in &snapshots {
        let restored = h.agent.get_entity("system", snapshot.entity_id).unwrap().unwrap();
        assert_eq!(restored, snapshot.snapshot_data);
    }
    assert!(live.contains(&excel));

    let record = h.agent.store().audit(audit).unwrap().unwrap();
    assert!(record.is_rolled_back());
    assert_eq!(record.rollback_reason.as_deref(), Some("different products"));

    let err = h.agent.rollback(audit, "again").unwrap_err();
    assert!(err.is_already_rolled_back());
    assert_eq!(h.systems(), live);
}

#[test]
fn later_merge_blocks_rollback_until_undone() {
    let h = Harness::new();
    h.system(0, "Excel");
    let first = h.system(1, "Microsoft Excel").audits[0];
    let second = h.system(2, "MS Excel").audits[0];
    assert_eq!(h.systems().len(), 1);

    let err = h.agent.rollback(first, "too early").unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Rollback(RollbackError::ConflictingLaterMerge { later_audit_id, .. })
            if later_audit_id == second
    ));
    assert_eq!(h.systems().len(), 1);

    h.agent.rollback(second, "undo newest first").unwrap();
    h.agent.rollback(first, "then the older one").unwrap();
    let names: Vec<String> = h
        .systems()
        .iter()
        .map(|e| e.primary_text().to_string())
        .collect();
    assert_eq!(names, vec!["Excel", "Microsoft Excel", "MS Excel"]);
}

#[test]
fn rollback_restores_pre_merge_edges() {
    let h = Harness::new();
    let excel = h.system(0, "Excel").entities_of(EntityKind::System)[0].entity_ref();
    let pain = h
        .agent
        .consolidate(
            vec![ExtractedEntity::new("pain_point").field("description", "copy-paste errors")],
            h.sources[0],
        )
        .unwrap()
        .entities_of(EntityKind::PainPoint)[0]
        .entity_ref();
    let edge = h
        .agent
        .add_relationship(NewRelationship::new(pain, "caused_by", excel).strength(0.6))
        .unwrap();

    let merge = h.system(1, "Microsoft Excel");
    let result = merge.entities_of(EntityKind::System)[0].entity_ref();
    let moved = h.agent.store().relationship(edge).unwrap().unwrap();
    assert_eq!(moved.target, result);

    let outcome = h.agent.rollback(merge.audits[0], "wrong").unwrap();
    assert_eq!(outcome.relationships_restored, 1);
    let restored = h.agent.store().relationship(edge).unwrap().unwrap();
    assert_eq!(restored.target, excel);
    assert_eq!(restored.strength, 0.6);
}

#[test]
fn edges_added_after_merge_move_to_canonical_member() {
    let h = Harness::new();
    let excel = h.system(0, "Excel").entities_of(EntityKind::System)[0].entity_ref();
    let merge = h.system(1, "Microsoft Excel");
    let result = merge.entities_of(EntityKind::System)[0].entity_ref();

    let pain = h
        .agent
        .consolidate(
            vec![ExtractedEntity::new("pain_point").field("description", "broken macros")],
            h.sources[1],
        )
        .unwrap()
        .entities_of(EntityKind::PainPoint)[0]
        .entity_ref();
    let edge = h
        .agent
        .add_relationship(NewRelationship::new(pain, "caused_by", result))
        .unwrap();

    let outcome = h.agent.rollback(merge.audits[0], "wrong").unwrap();
    assert_eq!(outcome.relationships_repointed, 1);
    assert_eq!(h.agent.store().relationship(edge).unwrap().unwrap().target, excel);
}

#[test]
fn missing_snapshot_aborts_rollback() {
    let store = EntityStore::in_memory();
    let manager = AuditAndSnapshotManager::new(Arc::new(ManualClock::new(Utc::now())));
    let mut tx = store.begin().unwrap();
    let source = tx.allocate_source_id().unwrap();
    tx.put_source(NewSource::new("Interview").into_source(source, Utc::now()).unwrap())
        .unwrap();
    let mention = |name: &str| {
        Entity::mention(EntityKind::System, source, 0.7, Utc::now()).with_field("name", name)
    };
    let a = tx.upsert(EntityKind::System, mention("Excel")).unwrap();
    let b = tx.upsert(EntityKind::System, mention("Excel 365")).unwrap();
    let result = tx.upsert(EntityKind::System, mention("Excel")).unwrap();
    let audit = manager
        .begin_merge(
            &mut tx,
            MergeRequest {
                kind: EntityKind::System,
                members: &[a, b],
                result,
                canonical_member: a,
                similarity_score: 0.9,
                run_id: None,
            },
        )
        .unwrap();

    // Pretend a member was never snapshotted by rewriting the audit.
    let mut record = tx.audit(audit).cloned().unwrap();
    record.merged_entity_ids.push(EntityId::new(4242));
    tx.put_audit(record).unwrap();

    let err = manager.rollback(&mut tx, audit, "x").unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Rollback(RollbackError::MissingSnapshot { entity_id, .. })
            if entity_id == EntityId::new(4242)
    ));
    assert!(tx.is_live(EntityRef::new(EntityKind::System, result)));
}

#[test]
fn unknown_audit_is_reported() {
    let h = Harness::new();
    let err = h.agent.rollback(AuditId::new(77), "nothing there").unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Rollback(RollbackError::AuditNotFound { .. })
    ));
}

#[test]
fn list_audits_filters_by_type_and_time() {
    let h = Harness::new();
    h.system(0, "Excel");
    let cutoff = h.clock.now();
    h.system(1, "Microsoft Excel");

    assert_eq!(h.agent.list_audits(Some("system"), None).unwrap().len(), 1);
    assert!(h.agent.list_audits(Some("kpi"), None).unwrap().is_empty());
    assert_eq!(h.agent.list_audits(None, Some(cutoff)).unwrap().len(), 1);
    assert!(h
        .agent
        .list_audits(None, Some(cutoff + Duration::days(1)))
        .unwrap()
        .is_empty());

    let audit = &h.agent.list_audits(None, None).unwrap()[0];
    let snapshot = h
        .agent
        .get_snapshot("system", audit.merged_entity_ids[0])
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.audit_id, audit.id);
}
