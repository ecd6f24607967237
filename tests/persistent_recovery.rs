//! Durability of the write-ahead-log backed store.

#![cfg(feature = "persistent")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use kyro_consolidate::storage::persistent::{open_store, PersistentConfig, WAL_FILE};
use kyro_consolidate::{
    ConsolidationAgent, ConsolidationConfig, ConsolidationError, EntityFilter, EntityKind,
    ExtractedEntity, NewSource, StorageError,
};
use tempfile::tempdir;

fn agent(dir: &Path) -> ConsolidationAgent {
    let store = open_store(dir, None).unwrap();
    let config = ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75);
    ConsolidationAgent::new(Arc::new(store), config).unwrap()
}

fn system(name: &str) -> ExtractedEntity {
    ExtractedEntity::new("system").field("name", name)
}

#[test]
fn merges_and_audits_survive_reopen() {
    let dir = tempdir().unwrap();
    let (audit, merged) = {
        let agent = agent(dir.path());
        let a = agent.register_source(NewSource::new("Interview 1").company("Acme")).unwrap();
        let b = agent.register_source(NewSource::new("Interview 2").company("Globex")).unwrap();
        agent.consolidate(vec![system("Excel")], a).unwrap();
        let result = agent.consolidate(vec![system("Microsoft Excel")], b).unwrap();
        (result.audits[0], result.entities_of(EntityKind::System)[0].clone())
    };

    let agent = agent(dir.path());
    assert_eq!(agent.store().source_count().unwrap(), 2);
    assert_eq!(agent.get_entity("system", merged.id).unwrap(), Some(merged.clone()));
    let record = agent.store().audit(audit).unwrap().unwrap();
    assert_eq!(record.resulting_entity_id, merged.id);
    assert_eq!(agent.store().snapshots_for_audit(audit).unwrap().len(), 2);

    agent.rollback(audit, "split after review").unwrap();
    assert_eq!(agent.list_entities("system", &EntityFilter::all()).unwrap().len(), 2);
    drop(agent);

    let agent = self::agent(dir.path());
    assert_eq!(agent.store().count(EntityKind::System).unwrap(), 2);
    assert!(agent.store().audit(audit).unwrap().unwrap().is_rolled_back());
}

#[test]
fn ids_keep_increasing_after_reopen() {
    let dir = tempdir().unwrap();
    let first = {
        let agent = agent(dir.path());
        let s = agent.register_source(NewSource::new("Interview 1")).unwrap();
        agent.consolidate(vec![system("SAP")], s).unwrap().entities_of(EntityKind::System)[0].id
    };

    let agent = agent(dir.path());
    let s = agent.register_source(NewSource::new("Interview 2")).unwrap();
    let second = agent
        .consolidate(vec![system("Workday")], s)
        .unwrap()
        .entities_of(EntityKind::System)[0]
        .id;
    assert!(second > first);
}

#[test]
fn second_open_is_locked_out() {
    let dir = tempdir().unwrap();
    let held = open_store(dir.path(), None).unwrap();

    let err = open_store(dir.path(), None).unwrap_err();
    assert!(matches!(
        err,
        ConsolidationError::Storage(StorageError::Locked(_))
    ));
    assert!(err.is_retryable());
    #[cfg(unix)]
    assert!(err.to_string().contains(&format!("pid {}", std::process::id())));

    drop(held);
    assert!(open_store(dir.path(), None).is_ok());
}

#[test]
fn torn_tail_is_discarded_on_open() {
    let dir = tempdir().unwrap();
    {
        let agent = agent(dir.path());
        for (n, name) in ["SAP", "Jira", "Workday", "NetSuite", "Salesforce"].iter().enumerate() {
            let s = agent
                .register_source(NewSource::new(format!("Interview {n}")))
                .unwrap();
            agent.consolidate(vec![system(name)], s).unwrap();
        }
    }

    // Cut into the last commit as a crash mid-append would.
    let wal = dir.path().join(WAL_FILE);
    let file = fs::OpenOptions::new().write(true).open(&wal).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - 3).unwrap();
    drop(file);

    let agent = agent(dir.path());
    let names: Vec<String> = agent
        .list_entities("system", &EntityFilter::all())
        .unwrap()
        .iter()
        .map(|e| e.primary_text().to_string())
        .collect();
    assert_eq!(names, ["SAP", "Jira", "Workday", "NetSuite"]);
    assert_eq!(agent.store().source_count().unwrap(), 5);

    // The log accepts new commits after recovery.
    let s = agent.register_source(NewSource::new("Interview 6")).unwrap();
    agent.consolidate(vec![system("Salesforce")], s).unwrap();
    drop(agent);
    assert_eq!(self::agent(dir.path()).store().count(EntityKind::System).unwrap(), 5);
}

#[test]
fn compaction_keeps_state_and_shrinks_the_log() {
    let dir = tempdir().unwrap();
    let config = PersistentConfig {
        max_wal_size: 1024 * 1024,
        sync_on_write: false,
    };
    let wal = dir.path().join(WAL_FILE);
    let kept = {
        let store = open_store(dir.path(), Some(config)).unwrap();
        let agent = ConsolidationAgent::new(Arc::new(store), ConsolidationConfig::default()).unwrap();
        let s = agent.register_source(NewSource::new("Interview 1")).unwrap();
        let a = agent.consolidate(vec![system("Excel")], s).unwrap().entities_of(EntityKind::System)[0].id;
        agent.consolidate(vec![system("Jira")], s).unwrap();
        agent.remove_entity("system", a).unwrap();

        let before = fs::metadata(&wal).unwrap().len();
        agent.store().compact().unwrap();
        assert!(fs::metadata(&wal).unwrap().len() <= before);
        agent.list_entities("system", &EntityFilter::all()).unwrap()
    };

    let store = open_store(dir.path(), Some(config)).unwrap();
    assert_eq!(store.list(EntityKind::System, &EntityFilter::all()).unwrap(), kept);
    assert_eq!(store.source_count().unwrap(), 1);
}
