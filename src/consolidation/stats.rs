//! Run statistics and results.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::audit::{AuditId, RunId};
use crate::contradiction::ContradictionDetectedWarning;
use crate::entity::{Entity, EntityKind};

/// Counters for one `consolidate` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    /// Incoming records accepted for processing.
    pub entities_processed: usize,
    /// Incoming records that joined a cluster with at least one other member.
    pub duplicates_found: usize,
    /// Merge transactions committed.
    pub entities_merged: usize,
    /// Contradictions first recorded by this run.
    pub contradictions_detected: usize,
    /// Incoming records stored as new single-source entities.
    pub new_entities: usize,
    /// Incoming records whose best match already mentions the batch source.
    pub already_consolidated: usize,
    /// Embedding failures that forced lexical-only scoring.
    pub lexical_fallbacks: u64,
    /// Clusters whose transaction was aborted.
    pub failed_clusters: usize,
    /// The run stopped early on its cancel token.
    pub cancelled: bool,
    /// Wall time of the whole call.
    pub processing_time: Duration,
}

/// Accumulates counters while a run is in progress.
///
/// Each kind gets its own builder; the agent folds them together with
/// [`StatsBuilder::absorb`] and seals the result with [`StatsBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct StatsBuilder {
    stats: ConsolidationStats,
}

impl StatsBuilder {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `n` accepted records.
    pub fn processed(&mut self, n: usize) -> &mut Self {
        self.stats.entities_processed += n;
        self
    }

    /// A cluster of `incoming` new records was merged.
    pub fn merged(&mut self, incoming: usize, new_contradictions: usize) -> &mut Self {
        self.stats.entities_merged += 1;
        self.stats.duplicates_found += incoming;
        self.stats.contradictions_detected += new_contradictions;
        self
    }

    /// A record was stored as a new entity.
    pub fn inserted(&mut self) -> &mut Self {
        self.stats.new_entities += 1;
        self
    }

    /// A record resolved to an entity that already mentions its source.
    pub fn already_consolidated(&mut self) -> &mut Self {
        self.stats.already_consolidated += 1;
        self
    }

    /// A cluster transaction was aborted.
    pub fn failed(&mut self) -> &mut Self {
        self.stats.failed_clusters += 1;
        self
    }

    /// The run was cancelled.
    pub fn cancelled(&mut self) -> &mut Self {
        self.stats.cancelled = true;
        self
    }

    /// Counts `n` lexical-only fallbacks.
    pub fn fallbacks(&mut self, n: u64) -> &mut Self {
        self.stats.lexical_fallbacks += n;
        self
    }

    /// Adds another builder's counters to this one.
    pub fn absorb(&mut self, other: Self) -> &mut Self {
        let o = other.stats;
        let s = &mut self.stats;
        s.entities_processed += o.entities_processed;
        s.duplicates_found += o.duplicates_found;
        s.entities_merged += o.entities_merged;
        s.contradictions_detected += o.contradictions_detected;
        s.new_entities += o.new_entities;
        s.already_consolidated += o.already_consolidated;
        s.lexical_fallbacks += o.lexical_fallbacks;
        s.failed_clusters += o.failed_clusters;
        s.cancelled |= o.cancelled;
        self
    }

    /// Seals the counters with the run's wall time.
    #[must_use]
    pub fn build(self, processing_time: Duration) -> ConsolidationStats {
        ConsolidationStats {
            processing_time,
            ..self.stats
        }
    }
}

/// A cluster that could not be merged. Earlier clusters stay committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterFailure {
    /// Kind of the cluster.
    pub kind: EntityKind,
    /// Number of entities in the cluster.
    pub members: usize,
    /// Why the transaction was aborted.
    pub error: String,
}

/// Everything a `consolidate` call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationResult {
    /// Id shared by every audit this run wrote.
    pub run_id: RunId,
    /// Counters for the run.
    pub stats: ConsolidationStats,
    /// Resulting entities per kind: merged, new, or the stored entity an
    /// already-consolidated record resolved to. Ascending by id.
    pub entities: BTreeMap<EntityKind, Vec<Entity>>,
    /// Audit records written by this run, ascending.
    pub audits: Vec<AuditId>,
    /// Contradictions first recorded by this run.
    pub warnings: Vec<ContradictionDetectedWarning>,
    /// Clusters that could not be merged.
    pub failures: Vec<ClusterFailure>,
}

impl ConsolidationResult {
    /// Resulting entities of one kind.
    #[must_use]
    pub fn entities_of(&self, kind: EntityKind) -> &[Entity] {
        self.entities.get(&kind).map_or(&[], Vec::as_slice)
    }
}

/// Cooperative cancellation, checked between cluster transactions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the run to stop before its next cluster.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once [`CancelToken::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
