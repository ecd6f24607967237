//! Entity listing filters.

use crate::entity::Entity;
use crate::source::SourceId;

/// Filter for [`EntityStore::list`](super::EntityStore::list).
///
/// Results are always ordered by ascending id; `limit` applies after
/// filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityFilter {
    /// Only entities mentioned in this source.
    pub mentioned_in: Option<SourceId>,
    /// Only merged (or only unmerged) entities.
    pub consolidated: Option<bool>,
    /// Only entities with (or without) contradictions.
    pub has_contradictions: Option<bool>,
    /// Only entities at or above this confidence.
    pub min_confidence: Option<f64>,
    /// At most this many results.
    pub limit: Option<usize>,
}

impl EntityFilter {
    /// Matches everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to entities mentioned in `source`.
    #[must_use]
    pub const fn mentioned_in(mut self, source: SourceId) -> Self {
        self.mentioned_in = Some(source);
        self
    }

    /// Restricts on `is_consolidated`.
    #[must_use]
    pub const fn consolidated(mut self, value: bool) -> Self {
        self.consolidated = Some(value);
        self
    }

    /// Restricts on `has_contradictions`.
    #[must_use]
    pub const fn has_contradictions(mut self, value: bool) -> Self {
        self.has_contradictions = Some(value);
        self
    }

    /// Restricts to a minimum consensus confidence.
    #[must_use]
    pub const fn min_confidence(mut self, value: f64) -> Self {
        self.min_confidence = Some(value);
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `entity` passes every set criterion.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        self.mentioned_in.map_or(true, |s| entity.mentions(s))
            && self.consolidated.map_or(true, |c| entity.is_consolidated == c)
            && self
                .has_contradictions
                .map_or(true, |c| entity.has_contradictions == c)
            && self
                .min_confidence
                .map_or(true, |m| entity.consensus_confidence >= m)
    }
}
