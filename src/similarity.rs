//! Duplicate-likelihood scoring.
//!
//! Two signals are computed over an entity's primary text field:
//!
//! - **lexical**: on normalized text, the better of a token score (Jaccard,
//!   or the overlap coefficient scaled by `containment_weight`) and a
//!   Levenshtein edit ratio. Identical normalized texts score 1.0.
//! - **semantic**: cosine similarity of embeddings, clamped to `[0, 1]`,
//!   when an [`EmbeddingProvider`] is configured.
//!
//! The two are combined per kind ([`ScoreCombination`]). If the provider
//! fails, the matcher logs a warning and stays lexical-only for the rest of
//! the run.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{ConsolidationConfig, ScoreCombination};
use crate::embedding::{cosine, EmbeddingCache, EmbeddingProvider};
use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{KcResult, SimilarityComputationError};
use crate::storage::{EntityFilter, EntityStore, StorageError};

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("separator pattern is valid"))
}

/// Lowercases and collapses every run of non-alphanumerics to one space.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    separator_pattern()
        .replace_all(&text.to_lowercase(), " ")
        .trim()
        .to_string()
}

fn tokens(normalized: &str) -> BTreeSet<&str> {
    normalized.split_whitespace().collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - levenshtein / max_len` on already-normalized text.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn edit_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Token-set score on already-normalized text.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn token_score(a: &str, b: &str, containment_weight: f64) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    let smaller = ta.len().min(tb.len()) as f64;
    (shared / union).max(containment_weight * (shared / smaller))
}

/// Lexical similarity of two raw texts, in `[0, 1]`.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::similarity::lexical_score;
///
/// assert_eq!(lexical_score("Excel", "Microsoft Excel", 0.8), 0.8);
/// assert_eq!(lexical_score("SAP  ERP", "sap-erp", 0.8), 1.0);
/// ```
#[must_use]
pub fn lexical_score(a: &str, b: &str, containment_weight: f64) -> f64 {
    let (na, nb) = (normalize_text(a), normalize_text(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    token_score(&na, &nb, containment_weight)
        .max(edit_ratio(&na, &nb))
        .clamp(0.0, 1.0)
}

/// The parts of one similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    /// Normalized string similarity of the primary texts.
    pub lexical: f64,
    /// `None` when no provider is configured or the run has degraded.
    pub semantic: Option<f64>,
    /// The score compared against the threshold.
    pub combined: f64,
}

/// A stored entity that cleared the match threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// The stored entity.
    pub entity_id: EntityId,
    /// Combined similarity score.
    pub score: f64,
    /// Mentions behind the stored entity.
    pub source_count: u32,
    /// Earliest mention of the stored entity.
    pub first_mentioned_at: DateTime<Utc>,
}

impl Candidate {
    fn of(entity: &Entity, score: f64) -> Self {
        Self {
            entity_id: entity.id,
            score,
            source_count: entity.source_count,
            first_mentioned_at: entity.first_mentioned_at,
        }
    }

    /// Score descending, then `source_count` descending, then earlier first
    /// mention, then lower id.
    fn rank_order(a: &Self, b: &Self) -> CmpOrdering {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| b.source_count.cmp(&a.source_count))
            .then_with(|| a.first_mentioned_at.cmp(&b.first_mentioned_at))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    }
}

/// Scores pairs of same-kind entities.
pub struct SimilarityMatcher {
    config: Arc<ConsolidationConfig>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cache: EmbeddingCache,
    fallbacks: AtomicU64,
    degraded: AtomicBool,
}

impl std::fmt::Debug for SimilarityMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityMatcher")
            .field("semantic", &self.embedder.is_some())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl SimilarityMatcher {
    /// A lexical-only matcher.
    #[must_use]
    pub fn new(config: Arc<ConsolidationConfig>) -> Self {
        let cache = EmbeddingCache::new(config.embedding_cache_capacity);
        Self {
            config,
            embedder: None,
            cache,
            fallbacks: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// Adds a semantic signal.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Re-enables the semantic signal after a degraded run.
    pub fn begin_run(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }

    /// True once an embedding failure has switched this run to lexical-only.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Total embedding failures since construction.
    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn embed(&self, provider: &dyn EmbeddingProvider, text: &str) -> Result<Arc<[f32]>, SimilarityComputationError> {
        self.cache.get_or_compute(text, |t| provider.embed(t))
    }

    fn semantic(&self, a: &str, b: &str) -> Option<f64> {
        let provider = self.embedder.as_deref()?;
        if self.is_degraded() {
            return None;
        }
        let (na, nb) = (normalize_text(a), normalize_text(b));
        let result = self
            .embed(provider, &na)
            .and_then(|va| self.embed(provider, &nb).map(|vb| (va, vb)));
        match result {
            Ok((va, vb)) => Some(cosine(&va, &vb).unwrap_or(0.0).clamp(0.0, 1.0)),
            Err(e) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "embedding failed; falling back to lexical-only scoring");
                }
                None
            }
        }
    }

    /// Full score of `candidate` against `existing`, using `kind`'s policy.
    #[must_use]
    pub fn score_detailed(&self, kind: EntityKind, candidate: &str, existing: &str) -> ScoreBreakdown {
        let lexical = lexical_score(candidate, existing, self.config.containment_weight);
        // Exact matches need no second opinion.
        let semantic = if lexical >= 1.0 {
            None
        } else {
            self.semantic(candidate, existing)
        };
        let combination: ScoreCombination = self.config.combination_for(kind);
        ScoreBreakdown {
            lexical,
            semantic,
            combined: combination.combine(lexical, semantic),
        }
    }

    /// Duplicate likelihood in `[0, 1]`.
    #[must_use]
    pub fn score(&self, candidate: &Entity, existing: &Entity) -> f64 {
        self.score_detailed(candidate.kind, candidate.primary_text(), existing.primary_text())
            .combined
    }

    /// Scores `entity` against `pool` and returns the best `top_k` matches
    /// at or above the kind's threshold. `entity` itself is skipped.
    pub fn rank<'e>(
        &self,
        entity: &Entity,
        pool: impl IntoIterator<Item = &'e Entity>,
        top_k: usize,
    ) -> Vec<Candidate> {
        let threshold = self.config.threshold_for(entity.kind);
        let mut out: Vec<Candidate> = pool
            .into_iter()
            .filter(|other| other.kind == entity.kind)
            .filter(|other| entity.id.is_unassigned() || other.id != entity.id)
            .filter_map(|other| {
                let score = self.score(entity, other);
                debug!(
                    kind = %entity.kind,
                    candidate = other.id.get(),
                    score,
                    threshold,
                    "scored candidate"
                );
                (score >= threshold).then(|| Candidate::of(other, score))
            })
            .collect();
        out.sort_by(Candidate::rank_order);
        out.truncate(top_k);
        out
    }

    /// Scores `entity` against every stored entity of `kind`.
    ///
    /// # Errors
    ///
    /// `KindMismatch` if `entity` is not of `kind`; storage read failures.
    pub fn find_candidates(
        &self,
        store: &EntityStore,
        entity: &Entity,
        kind: EntityKind,
        top_k: usize,
    ) -> KcResult<Vec<Candidate>> {
        if entity.kind != kind {
            return Err(StorageError::KindMismatch {
                expected: kind,
                actual: entity.kind,
            }
            .into());
        }
        let stored = store.list(kind, &EntityFilter::all())?;
        Ok(self.rank(entity, &stored, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceId;

    struct Failing;

    impl EmbeddingProvider for Failing {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, SimilarityComputationError> {
            Err(SimilarityComputationError::ProviderUnavailable {
                message: "offline".to_string(),
            })
        }

        fn dimension(&self) -> usize {
            8
        }
    }

    struct Fixed(f32);

    impl EmbeddingProvider for Fixed {
        fn embed(&self, text: &str) -> Result<Vec<f32>, SimilarityComputationError> {
            // Orthogonal unless texts are "spreadsheet"-ish.
            if text.contains("spreadsheet") || text.contains("excel") {
                Ok(vec![1.0, self.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn system(id: u64, name: &str, sources: u32, minutes: i64) -> Entity {
        let mut e = Entity::mention(
            EntityKind::System,
            SourceId::new(1),
            0.8,
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::minutes(minutes),
        )
        .with_field("name", name);
        e.id = EntityId::new(id);
        e.source_count = sources;
        e
    }

    fn matcher() -> SimilarityMatcher {
        SimilarityMatcher::new(Arc::new(ConsolidationConfig::default()))
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Microsoft-Excel (365) "), "microsoft excel 365");
        assert_eq!(normalize_text("Zoë's   CRM"), "zoë s crm");
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_lexical_examples() {
        assert_eq!(lexical_score("Excel", "Microsoft Excel", 0.8), 0.8);
        assert_eq!(lexical_score("Excel", "excel", 0.8), 1.0);
        assert!(lexical_score("Salesforce", "Salesforc", 0.8) > 0.85);
        assert!(lexical_score("SAP", "Workday", 0.8) < 0.3);
        assert_eq!(lexical_score("", "Excel", 0.8), 0.0);
    }

    #[test]
    fn test_rank_orders_ties_by_source_count_then_age_then_id() {
        let m = matcher();
        let incoming = system(0, "Excel", 1, 100);
        let pool = [
            system(7, "Excel", 1, 10),
            system(3, "Excel", 1, 10),
            system(5, "Excel", 4, 50),
            system(9, "Excel", 1, 5),
            system(2, "Workday", 9, 0),
        ];
        let ids: Vec<u64> = m
            .rank(&incoming, &pool, 10)
            .iter()
            .map(|c| c.entity_id.get())
            .collect();
        assert_eq!(ids, vec![5, 9, 3, 7]);
        assert_eq!(m.rank(&incoming, &pool, 2).len(), 2);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let incoming = system(0, "Excel", 1, 0);
        let pool = [system(1, "Microsoft Excel", 1, 0)];

        let exact = SimilarityMatcher::new(Arc::new(
            ConsolidationConfig::default().with_threshold(EntityKind::System, 0.8),
        ));
        assert_eq!(exact.rank(&incoming, &pool, 5).len(), 1);

        let above = SimilarityMatcher::new(Arc::new(
            ConsolidationConfig::default().with_threshold(EntityKind::System, 0.8 + 1e-9),
        ));
        assert!(above.rank(&incoming, &pool, 5).is_empty());
    }

    #[test]
    fn test_semantic_signal_can_lift_score() {
        let m = matcher().with_embedder(Arc::new(Fixed(0.0)));
        let b = m.score_detailed(EntityKind::System, "Excel", "Spreadsheet tool");
        assert!(b.lexical < 0.5);
        assert_eq!(b.semantic, Some(1.0));
        assert_eq!(b.combined, 1.0);
    }

    #[test]
    fn test_provider_failure_degrades_to_lexical() {
        let m = matcher().with_embedder(Arc::new(Failing));
        let first = m.score_detailed(EntityKind::System, "Excel", "Microsoft Excel");
        assert_eq!(first.semantic, None);
        assert_eq!(first.combined, 0.8);
        assert!(m.is_degraded());

        let _ = m.score_detailed(EntityKind::System, "SAP", "SAP ERP");
        assert_eq!(m.fallbacks(), 1);

        m.begin_run();
        assert!(!m.is_degraded());
    }
}
