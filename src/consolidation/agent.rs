//! The consolidation orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use tracing::{debug, error, info, info_span, warn};

use crate::audit::{AuditFilter, AuditId, AuditRecord, EntitySnapshot, RunId};
use crate::config::ConsolidationConfig;
use crate::contradiction::ContradictionDetectedWarning;
use crate::embedding::{BoundedEmbedder, EmbeddingProvider};
use crate::entity::{Entity, EntityId, EntityKind, EntityRef, ExtractedEntity};
use crate::error::{KcResult, RollbackError, ValidationError};
use crate::pattern::{self, Pattern};
use crate::relationship::{NewRelationship, RelationshipId};
use crate::similarity::SimilarityMatcher;
use crate::source::{NewSource, SourceId};
use crate::storage::{EntityFilter, EntityStore, StorageError};
use crate::time::{Clock, SystemClock};

use super::audit::{AuditAndSnapshotManager, MergeRequest, RollbackOutcome};
use super::cluster::{Cluster, ClusterBuilder};
use super::locks::KindLocks;
use super::merge::MergeResolver;
use super::rewrite::RelationshipRewriter;
use super::stats::{CancelToken, ClusterFailure, ConsolidationResult, StatsBuilder};

/// Pending embedding calls beyond which new calls fail fast.
const EMBEDDING_QUEUE_CAPACITY: usize = 64;

/// A cluster member: a row already in the store, or the n-th record of the
/// batch being consolidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Stored(EntityId),
    Incoming(usize),
}

#[derive(Debug, Default)]
struct KindOutcome {
    stats: StatsBuilder,
    entities: Vec<Entity>,
    audits: Vec<AuditId>,
    warnings: Vec<ContradictionDetectedWarning>,
    failures: Vec<ClusterFailure>,
}

impl KindOutcome {
    fn fail(&mut self, kind: EntityKind, members: usize, err: &dyn std::fmt::Display) {
        error!(kind = %kind, members, error = %err, "cluster aborted");
        self.stats.failed();
        self.failures.push(ClusterFailure {
            kind,
            members,
            error: err.to_string(),
        });
    }
}

struct MergeOutcome {
    entity: Entity,
    audit: AuditId,
    incoming: usize,
    warnings: Vec<ContradictionDetectedWarning>,
}

/// Drives batches of extracted records through matching, merging and
/// storage.
///
/// Kinds are processed independently: in parallel when
/// [`ConsolidationConfig::parallel_kinds`] is set, serialized per kind by
/// the agent's lock registry. Each merge is one store transaction, so a
/// failure part-way through a run leaves earlier merges committed and the
/// failed cluster untouched.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use kyro_consolidate::{
///     ConsolidationAgent, ConsolidationConfig, EntityStore, ExtractedEntity, NewSource,
/// };
///
/// let agent = ConsolidationAgent::new(
///     Arc::new(EntityStore::in_memory()),
///     ConsolidationConfig::default(),
/// )?;
/// let source = agent.register_source(NewSource::new("Interview 1").company("Acme"))?;
/// let result = agent.consolidate(
///     vec![ExtractedEntity::new("system").field("name", "Excel")],
///     source,
/// )?;
/// assert_eq!(result.stats.new_entities, 1);
/// # Ok::<(), kyro_consolidate::ConsolidationError>(())
/// ```
pub struct ConsolidationAgent {
    store: Arc<EntityStore>,
    config: Arc<ConsolidationConfig>,
    matcher: SimilarityMatcher,
    resolver: MergeResolver,
    audits: AuditAndSnapshotManager,
    locks: KindLocks,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ConsolidationAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationAgent")
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

impl ConsolidationAgent {
    /// Creates a lexical-only agent over `store`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` fails validation.
    pub fn new(store: Arc<EntityStore>, config: ConsolidationConfig) -> KcResult<Self> {
        let config = Arc::new(config.validate()?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self {
            store,
            matcher: SimilarityMatcher::new(Arc::clone(&config)),
            resolver: MergeResolver::new(Arc::clone(&config)),
            audits: AuditAndSnapshotManager::new(Arc::clone(&clock)),
            locks: KindLocks::new(),
            config,
            clock,
        })
    }

    /// Adds semantic scoring through `provider`.
    ///
    /// The provider runs on its own worker thread and every call is bounded
    /// by `embedding_timeout_ms`.
    ///
    /// # Errors
    ///
    /// `Similarity` if the worker thread cannot be started.
    pub fn with_embedder(mut self, provider: Arc<dyn EmbeddingProvider>) -> KcResult<Self> {
        let bounded = BoundedEmbedder::start(
            provider,
            Duration::from_millis(self.config.embedding_timeout_ms),
            EMBEDDING_QUEUE_CAPACITY,
        )?;
        self.matcher = self.matcher.with_embedder(Arc::new(bounded));
        Ok(self)
    }

    /// Replaces the clock used for mention, audit and snapshot timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.audits = AuditAndSnapshotManager::new(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// The underlying store, for direct reads.
    #[must_use]
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// The validated settings this agent runs with.
    #[must_use]
    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Registers a source document and returns its id.
    ///
    /// # Errors
    ///
    /// `EmptySourceTitle`, or storage errors.
    pub fn register_source(&self, source: NewSource) -> KcResult<SourceId> {
        let mut tx = self.store.begin()?;
        let id = tx.allocate_source_id()?;
        tx.put_source(source.into_source(id, self.clock.now())?)?;
        tx.commit()?;
        info!(source = %id, "source registered");
        Ok(id)
    }

    /// Consolidates one batch of records extracted from `source`.
    ///
    /// # Errors
    ///
    /// Fails before any mutation if `source` is not registered or any
    /// record is invalid (including an unknown type name). Per-cluster
    /// failures do not fail the call; they are reported in
    /// [`ConsolidationResult::failures`].
    pub fn consolidate(
        &self,
        entities: Vec<ExtractedEntity>,
        source: SourceId,
    ) -> KcResult<ConsolidationResult> {
        self.consolidate_with_cancel(entities, source, &CancelToken::new())
    }

    /// Like [`consolidate`](Self::consolidate), stopping between cluster
    /// transactions once `cancel` is set.
    ///
    /// # Errors
    ///
    /// See [`consolidate`](Self::consolidate).
    pub fn consolidate_with_cancel(
        &self,
        entities: Vec<ExtractedEntity>,
        source: SourceId,
        cancel: &CancelToken,
    ) -> KcResult<ConsolidationResult> {
        let started = Instant::now();
        let run_id = RunId::new();
        let registered = self
            .store
            .source(source)?
            .ok_or(ValidationError::UnknownSource { id: source })?;

        let now = self.clock.now();
        let mut batches: BTreeMap<EntityKind, Vec<Entity>> = BTreeMap::new();
        for record in entities {
            let mention = record.into_mention(
                source,
                registered.company.as_deref(),
                self.config.default_confidence,
                now,
            )?;
            batches.entry(mention.kind).or_default().push(mention);
        }

        info!(run = %run_id, source = %source, kinds = batches.len(), "consolidation started");
        self.matcher.begin_run();
        let fallbacks_before = self.matcher.fallbacks();

        let outcomes = self.run_kinds(batches, |kind, mentions| {
            self.consolidate_kind(kind, &mentions, Some(source), run_id, cancel)
        });
        Ok(self.finish(run_id, outcomes, fallbacks_before, started))
    }

    /// Re-clusters the stored entities of one kind among themselves, for
    /// example after lowering its threshold.
    ///
    /// # Errors
    ///
    /// `InvalidEntityType` for an unknown type name.
    pub fn consolidate_stored(&self, entity_type: &str) -> KcResult<ConsolidationResult> {
        let kind = EntityKind::parse(entity_type)?;
        let started = Instant::now();
        let run_id = RunId::new();
        info!(run = %run_id, kind = %kind, "stored consolidation started");
        self.matcher.begin_run();
        let fallbacks_before = self.matcher.fallbacks();

        let cancel = CancelToken::new();
        let outcome = self.consolidate_kind(kind, &[], None, run_id, &cancel);
        Ok(self.finish(run_id, vec![(kind, outcome)], fallbacks_before, started))
    }

    fn run_kinds<F>(
        &self,
        batches: BTreeMap<EntityKind, Vec<Entity>>,
        run: F,
    ) -> Vec<(EntityKind, KindOutcome)>
    where
        F: Fn(EntityKind, Vec<Entity>) -> KindOutcome + Sync,
    {
        if !self.config.parallel_kinds || batches.len() < 2 {
            return batches
                .into_iter()
                .map(|(kind, mentions)| (kind, run(kind, mentions)))
                .collect();
        }

        let (tx, rx) = unbounded();
        thread::scope(|scope| {
            for (kind, mentions) in batches {
                let tx = tx.clone();
                let run = &run;
                scope.spawn(move || {
                    // The receiver outlives the scope.
                    let _ = tx.send((kind, run(kind, mentions)));
                });
            }
        });
        drop(tx);

        let mut outcomes: Vec<(EntityKind, KindOutcome)> = rx.into_iter().collect();
        outcomes.sort_by_key(|(kind, _)| *kind);
        outcomes
    }

    fn finish(
        &self,
        run_id: RunId,
        outcomes: Vec<(EntityKind, KindOutcome)>,
        fallbacks_before: u64,
        started: Instant,
    ) -> ConsolidationResult {
        let mut stats = StatsBuilder::new();
        let mut entities = BTreeMap::new();
        let mut audits = Vec::new();
        let mut warnings = Vec::new();
        let mut failures = Vec::new();

        for (kind, outcome) in outcomes {
            stats.absorb(outcome.stats);
            let mut resulting = outcome.entities;
            resulting.sort_by_key(|e| e.id);
            resulting.dedup_by_key(|e| e.id);
            if !resulting.is_empty() {
                entities.insert(kind, resulting);
            }
            audits.extend(outcome.audits);
            warnings.extend(outcome.warnings);
            failures.extend(outcome.failures);
        }
        audits.sort_unstable();
        stats.fallbacks(self.matcher.fallbacks().saturating_sub(fallbacks_before));
        let stats = stats.build(started.elapsed());

        info!(
            run = %run_id,
            processed = stats.entities_processed,
            merged = stats.entities_merged,
            duplicates = stats.duplicates_found,
            new = stats.new_entities,
            already_consolidated = stats.already_consolidated,
            contradictions = stats.contradictions_detected,
            failed = stats.failed_clusters,
            elapsed_ms = u64::try_from(stats.processing_time.as_millis()).unwrap_or(u64::MAX),
            "consolidation finished"
        );
        ConsolidationResult {
            run_id,
            stats,
            entities,
            audits,
            warnings,
            failures,
        }
    }

    /// Matches and merges one kind under its lock.
    ///
    /// With `source` set, `incoming` is a batch from that source; without
    /// it the stored entities are clustered among themselves.
    fn consolidate_kind(
        &self,
        kind: EntityKind,
        incoming: &[Entity],
        source: Option<SourceId>,
        run_id: RunId,
        cancel: &CancelToken,
    ) -> KindOutcome {
        let span = info_span!("consolidate_kind", kind = %kind, incoming = incoming.len());
        let _enter = span.enter();
        let _guard = self.locks.lock(kind);
        let mut outcome = KindOutcome::default();

        let stored = match self.store.list(kind, &EntityFilter::all()) {
            Ok(stored) => stored,
            Err(e) => {
                outcome.stats.processed(incoming.len());
                outcome.fail(kind, incoming.len(), &e);
                return outcome;
            }
        };

        let mut builder = ClusterBuilder::new();
        let mut resolved = Vec::new();
        match source {
            Some(source) => {
                outcome.stats.processed(incoming.len());
                self.link_incoming(kind, incoming, &stored, source, &mut builder, &mut resolved);
            }
            None => {
                outcome.stats.processed(stored.len());
                self.link_stored(&stored, &mut builder);
            }
        }
        for _ in &resolved {
            outcome.stats.already_consolidated();
        }

        for cluster in builder.build() {
            if cancel.is_cancelled() {
                outcome.stats.cancelled();
                warn!(kind = %kind, "run cancelled; remaining clusters skipped");
                break;
            }
            if cluster.is_singleton() {
                let Some(Node::Incoming(i)) = cluster.members.first().copied() else {
                    continue;
                };
                match self.insert_new(kind, &incoming[i]) {
                    Ok(entity) => {
                        outcome.stats.inserted();
                        outcome.entities.push(entity);
                    }
                    Err(e) => outcome.fail(kind, 1, &e),
                }
                continue;
            }
            match self.merge_cluster(kind, &cluster, incoming, run_id) {
                Ok(merged) => {
                    outcome
                        .stats
                        .merged(merged.incoming, merged.warnings.len());
                    outcome.entities.push(merged.entity);
                    outcome.audits.push(merged.audit);
                    outcome.warnings.extend(merged.warnings);
                }
                Err(e) => outcome.fail(kind, cluster.members.len(), &e),
            }
        }

        // A resolved entity may itself have been merged later in this run;
        // its result is already listed.
        for id in resolved {
            if let Ok(Some(entity)) = self.store.get(kind, id) {
                outcome.entities.push(entity);
            }
        }
        outcome
    }

    fn link_incoming(
        &self,
        kind: EntityKind,
        incoming: &[Entity],
        stored: &[Entity],
        source: SourceId,
        builder: &mut ClusterBuilder<Node>,
        resolved: &mut Vec<EntityId>,
    ) {
        let threshold = self.config.threshold_for(kind);
        let mut accepted: Vec<usize> = Vec::with_capacity(incoming.len());

        for (i, mention) in incoming.iter().enumerate() {
            let candidates = self.matcher.rank(mention, stored, self.config.top_k);
            let redelivered = candidates.first().and_then(|best| {
                stored
                    .iter()
                    .find(|e| e.id == best.entity_id)
                    .filter(|e| e.mentions(source))
            });
            if let Some(existing) = redelivered {
                debug!(
                    kind = %kind,
                    entity = existing.id.get(),
                    "record already consolidated from this source"
                );
                resolved.push(existing.id);
                continue;
            }

            let node = Node::Incoming(i);
            builder.add(node);
            for candidate in &candidates {
                builder.link(node, Node::Stored(candidate.entity_id), candidate.score);
            }
            for &j in &accepted {
                let score = self.matcher.score(mention, &incoming[j]);
                if score >= threshold {
                    debug!(kind = %kind, a = j, b = i, score, "batch records match");
                    builder.link(Node::Incoming(j), node, score);
                }
            }
            accepted.push(i);
        }
    }

    fn link_stored(&self, stored: &[Entity], builder: &mut ClusterBuilder<Node>) {
        for (i, entity) in stored.iter().enumerate() {
            let node = Node::Stored(entity.id);
            builder.add(node);
            for candidate in self.matcher.rank(entity, &stored[i + 1..], self.config.top_k) {
                builder.link(node, Node::Stored(candidate.entity_id), candidate.score);
            }
        }
    }

    fn insert_new(&self, kind: EntityKind, mention: &Entity) -> KcResult<Entity> {
        let mut tx = self.store.begin()?;
        let id = tx.upsert(kind, mention.clone())?;
        tx.commit()?;
        let mut entity = mention.clone();
        entity.id = id;
        debug!(kind = %kind, entity = id.get(), "new entity stored");
        Ok(entity)
    }

    /// One merge, one transaction: incoming members are stored first so
    /// every member has an id and a snapshot, then the merged entity is
    /// written, the audit and snapshots recorded, edges rewritten and the
    /// members deleted.
    fn merge_cluster(
        &self,
        kind: EntityKind,
        cluster: &Cluster<Node>,
        incoming: &[Entity],
        run_id: RunId,
    ) -> KcResult<MergeOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin()?;

        let mut member_ids = Vec::with_capacity(cluster.members.len());
        let mut fresh = 0;
        for node in &cluster.members {
            let id = match *node {
                Node::Stored(id) => id,
                Node::Incoming(i) => {
                    fresh += 1;
                    tx.upsert(kind, incoming[i].clone())?
                }
            };
            member_ids.push(id);
        }
        let mut members = Vec::with_capacity(member_ids.len());
        for id in &member_ids {
            let entity = tx
                .get(kind, *id)
                .cloned()
                .ok_or(StorageError::EntityNotFound(EntityRef::new(kind, *id)))?;
            members.push(entity);
        }

        let plan = self.resolver.plan(&members, now)?;
        let result = tx.upsert(kind, plan.merged.clone())?;
        let result_ref = EntityRef::new(kind, result);
        let similarity_score = cluster.min_link_score.unwrap_or(1.0);

        let audit = self.audits.begin_merge(
            &mut tx,
            MergeRequest {
                kind,
                members: &member_ids,
                result,
                canonical_member: plan.canonical_member,
                similarity_score,
                run_id: Some(run_id),
            },
        )?;

        let member_refs: Vec<EntityRef> = member_ids.iter().map(|id| EntityRef::new(kind, *id)).collect();
        let report = RelationshipRewriter::rewrite(&mut tx, &member_refs, result_ref)?;
        for id in &member_ids {
            tx.delete(kind, *id)?;
        }
        tx.commit()?;

        let mut entity = plan.merged;
        entity.id = result;
        info!(
            audit = %audit,
            kind = %kind,
            result = result.get(),
            members = member_ids.len(),
            score = similarity_score,
            repointed = report.repointed,
            deduplicated = report.deduplicated,
            "cluster merged"
        );

        let warnings: Vec<ContradictionDetectedWarning> = plan
            .new_contradictions
            .into_iter()
            .map(|detail| ContradictionDetectedWarning {
                entity: result_ref,
                detail,
            })
            .collect();
        for warning in &warnings {
            warn!(%warning, "contradiction detected");
        }

        Ok(MergeOutcome {
            entity,
            audit,
            incoming: fresh,
            warnings,
        })
    }

    /// Reverses one merge.
    ///
    /// # Errors
    ///
    /// `AuditNotFound`, `AlreadyRolledBack`, `MissingSnapshot`,
    /// `ConflictingLaterMerge` or `ResultMissing`, with no state change.
    pub fn rollback(&self, audit_id: AuditId, reason: &str) -> KcResult<RollbackOutcome> {
        let kind = self
            .store
            .audit(audit_id)?
            .ok_or(RollbackError::AuditNotFound { audit_id })?
            .entity_type;
        let _guard = self.locks.lock(kind);
        let mut tx = self.store.begin()?;
        let outcome = self.audits.rollback(&mut tx, audit_id, reason)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Audit records, optionally limited to one type and to merges at or
    /// after `since`.
    ///
    /// # Errors
    ///
    /// `InvalidEntityType` for an unknown type name.
    pub fn list_audits(
        &self,
        entity_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> KcResult<Vec<AuditRecord>> {
        let filter = AuditFilter {
            entity_type: entity_type.map(EntityKind::parse).transpose()?,
            since,
        };
        Ok(self.store.audits(&filter)?)
    }

    /// # Errors
    ///
    /// `InvalidEntityType` for an unknown type name.
    pub fn get_entity(&self, entity_type: &str, id: EntityId) -> KcResult<Option<Entity>> {
        let kind = EntityKind::parse(entity_type)?;
        Ok(self.store.get(kind, id)?)
    }

    /// # Errors
    ///
    /// `InvalidEntityType` for an unknown type name.
    pub fn list_entities(&self, entity_type: &str, filter: &EntityFilter) -> KcResult<Vec<Entity>> {
        let kind = EntityKind::parse(entity_type)?;
        Ok(self.store.list(kind, filter)?)
    }

    /// The most recent pre-merge snapshot of an entity.
    ///
    /// # Errors
    ///
    /// `InvalidEntityType` for an unknown type name.
    pub fn get_snapshot(&self, entity_type: &str, id: EntityId) -> KcResult<Option<EntitySnapshot>> {
        let kind = EntityKind::parse(entity_type)?;
        Ok(self.store.latest_snapshot(kind, id)?)
    }

    /// Recurring and contested patterns among the consolidated entities of
    /// one type.
    ///
    /// # Errors
    ///
    /// `InvalidEntityType`, or `InvalidConfig` if `min_frequency` is not
    /// within `[0, 1]`.
    pub fn detect_patterns(&self, entity_type: &str, min_frequency: f64) -> KcResult<Vec<Pattern>> {
        let kind = EntityKind::parse(entity_type)?;
        if !(0.0..=1.0).contains(&min_frequency) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("min_frequency must be within [0, 1] (got {min_frequency})"),
            }
            .into());
        }
        let entities = self.store.list(kind, &EntityFilter::all().consolidated(true))?;
        let total = self.store.source_count()?;
        Ok(pattern::detect_patterns(&entities, total, min_frequency))
    }

    /// Adds an edge between two live entities.
    ///
    /// An edge with the same endpoints and type is updated in place: the
    /// stronger strength wins and sources are unioned.
    ///
    /// # Errors
    ///
    /// Validation errors, or `EntityNotFound` for a missing endpoint.
    pub fn add_relationship(&self, edge: NewRelationship) -> KcResult<RelationshipId> {
        edge.validate()?;
        let mut tx = self.store.begin()?;
        for endpoint in [edge.source, edge.target] {
            if !tx.is_live(endpoint) {
                return Err(StorageError::EntityNotFound(endpoint).into());
            }
        }

        let id = tx.allocate_relationship_id()?;
        let relationship = edge.into_relationship(id)?;
        let id = match tx.find_edge(&relationship.key()) {
            Some(mut existing) => {
                existing.strength = existing.strength.max(relationship.strength);
                existing.mentioned_in_sources.extend(relationship.mentioned_in_sources);
                let existing_id = existing.id;
                tx.put_relationship(existing)?;
                existing_id
            }
            None => {
                tx.put_relationship(relationship)?;
                id
            }
        };
        tx.commit()?;
        Ok(id)
    }

    /// Deletes an entity and every edge touching it.
    ///
    /// # Errors
    ///
    /// `InvalidEntityType`, or `EntityNotFound`.
    pub fn remove_entity(&self, entity_type: &str, id: EntityId) -> KcResult<Entity> {
        let kind = EntityKind::parse(entity_type)?;
        let _guard = self.locks.lock(kind);
        let mut tx = self.store.begin()?;
        for edge in tx.relationships_touching(EntityRef::new(kind, id)) {
            tx.remove_relationship(edge.id)?;
        }
        let removed = tx.delete(kind, id)?;
        tx.commit()?;
        info!(kind = %kind, entity = id.get(), "entity removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn agent() -> (ConsolidationAgent, SourceId, SourceId) {
        let config = ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75);
        let agent = ConsolidationAgent::new(Arc::new(EntityStore::in_memory()), config)
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH)));
        let a = agent.register_source(NewSource::new("Interview 1").company("Acme")).unwrap();
        let b = agent.register_source(NewSource::new("Interview 2").company("Globex")).unwrap();
        (agent, a, b)
    }

    fn system(name: &str) -> ExtractedEntity {
        ExtractedEntity::new("system").field("name", name)
    }

    #[test]
    fn test_batch_records_cluster_with_each_other() {
        let (agent, a, _) = agent();
        let result = agent
            .consolidate(vec![system("Excel"), system("Microsoft Excel"), system("SAP")], a)
            .unwrap();
        assert_eq!(result.stats.entities_processed, 3);
        assert_eq!(result.stats.entities_merged, 1);
        assert_eq!(result.stats.duplicates_found, 2);
        assert_eq!(result.stats.new_entities, 1);
        assert_eq!(agent.store().count(EntityKind::System).unwrap(), 2);
        assert_eq!(result.audits.len(), 1);
    }

    #[test]
    fn test_unknown_source_fails_before_mutation() {
        let (agent, _, _) = agent();
        let err = agent.consolidate(vec![system("Excel")], SourceId::new(99)).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(agent.store().count(EntityKind::System).unwrap(), 0);
    }

    #[test]
    fn test_cancelled_run_skips_clusters() {
        let (agent, a, _) = agent();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = agent
            .consolidate_with_cancel(vec![system("Excel")], a, &cancel)
            .unwrap();
        assert!(result.stats.cancelled);
        assert_eq!(result.stats.new_entities, 0);
        assert_eq!(agent.store().count(EntityKind::System).unwrap(), 0);
    }

    #[test]
    fn test_consolidate_stored_after_threshold_change() {
        let store = Arc::new(EntityStore::in_memory());
        let strict = ConsolidationAgent::new(
            Arc::clone(&store),
            ConsolidationConfig::default().with_threshold(EntityKind::System, 0.95),
        )
        .unwrap();
        let a = strict.register_source(NewSource::new("Interview 1")).unwrap();
        let b = strict.register_source(NewSource::new("Interview 2")).unwrap();
        strict.consolidate(vec![system("Excel")], a).unwrap();
        strict.consolidate(vec![system("Microsoft Excel")], b).unwrap();
        assert_eq!(store.count(EntityKind::System).unwrap(), 2);

        let lenient = ConsolidationAgent::new(
            Arc::clone(&store),
            ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75),
        )
        .unwrap();
        let result = lenient.consolidate_stored("system").unwrap();
        assert_eq!(result.stats.entities_merged, 1);
        assert_eq!(result.stats.duplicates_found, 0);
        assert_eq!(store.count(EntityKind::System).unwrap(), 1);
    }

    #[test]
    fn test_add_relationship_dedups_and_remove_entity_cascades() {
        let (agent, a, b) = agent();
        let systems = agent.consolidate(vec![system("Jira")], a).unwrap();
        let pains = agent
            .consolidate(
                vec![ExtractedEntity::new("pain_point").field("description", "ticket backlog")],
                b,
            )
            .unwrap();
        let jira = systems.entities_of(EntityKind::System)[0].entity_ref();
        let pain = pains.entities_of(EntityKind::PainPoint)[0].entity_ref();

        let first = agent
            .add_relationship(NewRelationship::new(pain, "caused_by", jira).strength(0.4).mentioned_in(a))
            .unwrap();
        let second = agent
            .add_relationship(NewRelationship::new(pain, "caused_by", jira).strength(0.9).mentioned_in(b))
            .unwrap();
        assert_eq!(first, second);
        let edge = agent.store().relationship(first).unwrap().unwrap();
        assert_eq!(edge.strength, 0.9);
        assert_eq!(edge.mentioned_in_sources.len(), 2);

        agent.remove_entity("system", jira.id).unwrap();
        assert!(agent.store().relationship(first).unwrap().is_none());
    }

    #[test]
    fn test_queries_reject_unknown_types() {
        let (agent, _, _) = agent();
        assert!(agent.get_entity("systems", EntityId::new(1)).unwrap_err().is_invalid_entity_type());
        assert!(agent.list_audits(Some("; DROP TABLE"), None).unwrap_err().is_invalid_entity_type());
        assert!(agent.detect_patterns("system", 1.5).unwrap_err().is_validation());
    }
}
