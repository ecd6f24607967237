//! Derived patterns over consolidated entities.
//!
//! Patterns are a read-only projection: nothing here writes to the store.
//! An entity mentioned across a large share of interviews is a recurring
//! pattern; an entity whose sources disagree is a contested one.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId, EntityKind};

/// Share of sources at or above which a recurring pattern is high priority.
pub const HIGH_PRIORITY_FREQUENCY: f64 = 0.5;

const SEVERITY_FIELDS: [&str; 3] = ["severity", "criticality", "impact"];
const HIGH_VALUES: [&str; 2] = ["high", "critical"];

/// Why an entity was reported as a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Mentioned by at least `min_frequency` of all sources.
    Recurring,
    /// Carries unresolved contradictions.
    Contested,
}

/// One entity worth surfacing across interviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Why it was reported.
    pub pattern_type: PatternType,
    /// Kind of the entity.
    pub entity_type: EntityKind,
    /// The entity.
    pub entity_id: EntityId,
    /// `|mentioned_in_sources| / |registered sources|`.
    pub frequency: f64,
    /// Mentions folded into the entity.
    pub source_count: u32,
    /// Frequent enough, or severe enough, to act on first.
    pub high_priority: bool,
    /// Human-readable summary.
    pub description: String,
}

fn is_severe(entity: &Entity) -> bool {
    SEVERITY_FIELDS.iter().any(|field| {
        entity
            .field(field)
            .and_then(|v| v.as_text())
            .is_some_and(|v| HIGH_VALUES.iter().any(|h| v.trim().eq_ignore_ascii_case(h)))
    })
}

/// Derives patterns from `entities` given the number of registered sources.
///
/// Output order: recurring patterns by descending frequency, then contested
/// ones, each tie broken by ascending id.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn detect_patterns(entities: &[Entity], total_sources: usize, min_frequency: f64) -> Vec<Pattern> {
    if total_sources == 0 {
        return Vec::new();
    }

    let mut recurring = Vec::new();
    let mut contested = Vec::new();

    for entity in entities {
        let frequency = (entity.mentioned_in_sources.len() as f64 / total_sources as f64).min(1.0);
        let label = entity.primary_text();

        if frequency >= min_frequency {
            recurring.push(Pattern {
                pattern_type: PatternType::Recurring,
                entity_type: entity.kind,
                entity_id: entity.id,
                frequency,
                source_count: entity.source_count,
                high_priority: frequency >= HIGH_PRIORITY_FREQUENCY || is_severe(entity),
                description: format!(
                    "{} '{label}' mentioned in {} of {total_sources} sources",
                    entity.kind,
                    entity.mentioned_in_sources.len()
                ),
            });
        }

        if entity.has_contradictions {
            let fields: Vec<&str> = entity
                .contradiction_details
                .iter()
                .map(|d| d.field.as_str())
                .collect();
            contested.push(Pattern {
                pattern_type: PatternType::Contested,
                entity_type: entity.kind,
                entity_id: entity.id,
                frequency,
                source_count: entity.source_count,
                high_priority: is_severe(entity),
                description: format!(
                    "{} '{label}' has conflicting {}",
                    entity.kind,
                    fields.join(", ")
                ),
            });
        }
    }

    recurring.sort_by(|a, b| {
        b.frequency
            .partial_cmp(&a.frequency)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    recurring.extend(contested);
    recurring
}
