//! Field-level merge of a cluster into one entity.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::confidence::{consensus, Contribution};
use crate::config::ConsolidationConfig;
use crate::contradiction::{self, ContradictionDetail};
use crate::entity::{Entity, EntityId, EntityKind};
use crate::error::{ConsolidationError, KcResult};
use crate::schema::{dedup_items, FieldShape};
use crate::source::SourceId;
use crate::value::FieldValue;

/// The outcome of merging one cluster, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Kind shared by every member.
    pub kind: EntityKind,
    /// The merged entity, with an unassigned id.
    pub merged: Entity,
    /// Member whose values won.
    pub canonical_member: EntityId,
    /// Contradictions no member carried before this merge.
    pub new_contradictions: Vec<ContradictionDetail>,
}

/// Decides what a merged entity looks like.
#[derive(Debug, Clone)]
pub struct MergeResolver {
    config: Arc<ConsolidationConfig>,
}

/// Largest `source_count`, then earliest first mention, then lowest id.
#[must_use]
pub fn select_canonical(members: &[Entity]) -> Option<&Entity> {
    members.iter().min_by(|a, b| {
        b.source_count
            .cmp(&a.source_count)
            .then_with(|| a.first_mentioned_at.cmp(&b.first_mentioned_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

impl MergeResolver {
    /// Creates a resolver over the given settings.
    #[must_use]
    pub const fn new(config: Arc<ConsolidationConfig>) -> Self {
        Self { config }
    }

    /// Merges `members` into one entity.
    ///
    /// - scalar fields take the canonical member's value, or the most
    ///   recently mentioned non-empty value if the canonical has none
    /// - list fields are unioned, canonical first, case-insensitively
    /// - `source_count` is summed and sources are unioned, per field too
    /// - confidence is the consensus of the members (never below the
    ///   strongest member)
    /// - single-valued fields that disagree are recorded as contradictions
    ///
    /// # Errors
    ///
    /// `Internal` if there are fewer than two members or they differ in kind.
    pub fn plan(&self, members: &[Entity], now: DateTime<Utc>) -> KcResult<MergePlan> {
        let Some(canonical) = select_canonical(members) else {
            return Err(ConsolidationError::internal("cannot merge an empty cluster"));
        };
        if members.len() < 2 {
            return Err(ConsolidationError::internal("a merge needs at least two members"));
        }
        let kind = canonical.kind;
        if let Some(other) = members.iter().find(|m| m.kind != kind) {
            return Err(ConsolidationError::internal(format!(
                "cannot merge {} into a {kind} cluster",
                other.entity_ref()
            )));
        }
        let schema = kind.schema();

        let mut chronological: Vec<&Entity> = members.iter().collect();
        chronological.sort_by(|a, b| {
            a.first_mentioned_at
                .cmp(&b.first_mentioned_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut by_recency = chronological.clone();
        by_recency.sort_by(|a, b| {
            b.last_mentioned_at
                .cmp(&a.last_mentioned_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let mut canonical_first: Vec<&Entity> = vec![canonical];
        canonical_first.extend(chronological.iter().copied().filter(|m| m.id != canonical.id));

        let mut merged = canonical.clone();
        merged.fields.clear();
        merged.field_sources.clear();

        let field_names: BTreeSet<&str> = members
            .iter()
            .flat_map(|m| m.fields.keys().map(String::as_str))
            .collect();
        for name in field_names {
            let shape = schema.spec(name).map_or(FieldShape::Scalar, |s| s.shape);
            let value = match shape {
                FieldShape::List => {
                    let items = dedup_items(
                        canonical_first
                            .iter()
                            .flat_map(|m| m.list(name).iter().cloned()),
                    );
                    (!items.is_empty()).then_some(FieldValue::List(items))
                }
                FieldShape::Scalar => canonical
                    .field(name)
                    .filter(|v| !v.is_empty())
                    .or_else(|| {
                        by_recency
                            .iter()
                            .find_map(|m| m.field(name).filter(|v| !v.is_empty()))
                    })
                    .cloned(),
            };
            if let Some(value) = value {
                merged.fields.insert(name.to_string(), value);
            }
            let reported: BTreeSet<SourceId> =
                members.iter().flat_map(|m| m.sources_of(name)).collect();
            if !reported.is_empty() {
                merged.field_sources.insert(name.to_string(), reported);
            }
        }

        merged.source_count = members.iter().map(|m| m.source_count).sum();
        merged.mentioned_in_sources = members
            .iter()
            .flat_map(|m| m.mentioned_in_sources.iter().copied())
            .collect();

        let contributions: Vec<Contribution> = members
            .iter()
            .map(|m| Contribution {
                confidence: m.consensus_confidence,
                weight: m.source_count,
            })
            .collect();
        merged.consensus_confidence = consensus(
            &contributions,
            merged.mentioned_in_sources.len(),
            self.config.corroboration_bonus,
        );

        // Configured fields plus any field a member already has a
        // contradiction on, so history is never dropped.
        let mut fields = self.config.contradiction_fields_for(kind);
        for detail in members.iter().flat_map(|m| &m.contradiction_details) {
            if !fields.contains(&detail.field) {
                fields.push(detail.field.clone());
            }
        }
        let field_refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        let details = contradiction::detect(&chronological, &field_refs);
        let new_contradictions = details
            .iter()
            .filter(|d| {
                // A new source repeating a known value is not a new conflict.
                !members
                    .iter()
                    .flat_map(|m| &m.contradiction_details)
                    .any(|prior| prior.field == d.field && prior.has_all_values_of(d))
            })
            .cloned()
            .collect();
        merged.has_contradictions = !details.is_empty();
        merged.contradiction_details = details;

        let mut lineage: Vec<EntityId> = members
            .iter()
            .flat_map(|m| m.merged_entity_ids.iter().copied().chain(std::iter::once(m.id)))
            .collect();
        lineage.sort_unstable();
        lineage.dedup();
        merged.merged_entity_ids = lineage;

        merged.first_mentioned_at = members
            .iter()
            .map(|m| m.first_mentioned_at)
            .min()
            .unwrap_or(now);
        merged.last_mentioned_at = members
            .iter()
            .map(|m| m.last_mentioned_at)
            .max()
            .unwrap_or(now);
        merged.is_consolidated = true;
        merged.consolidated_at = Some(now);
        merged.id = EntityId::UNASSIGNED;

        Ok(MergePlan {
            kind,
            merged,
            canonical_member: canonical.id,
            new_contradictions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes)
    }

    fn system(id: u64, source: u64, name: &str, company: &str, minutes: i64) -> Entity {
        let mut e = Entity::mention(EntityKind::System, SourceId::new(source), 0.7, at(minutes))
            .with_field("name", name)
            .with_field("companies_using", vec![company]);
        e.id = EntityId::new(id);
        e
    }

    fn resolver() -> MergeResolver {
        MergeResolver::new(Arc::new(ConsolidationConfig::default()))
    }

    #[test]
    fn test_canonical_selection() {
        let mut a = system(3, 1, "Excel", "Acme", 10);
        let b = system(2, 2, "Microsoft Excel", "Globex", 5);
        let c = system(1, 3, "MS Excel", "Initech", 5);
        assert_eq!(select_canonical(&[a.clone(), b.clone(), c.clone()]).unwrap().id.get(), 1);
        a.source_count = 2;
        assert_eq!(select_canonical(&[a, b, c]).unwrap().id.get(), 3);
    }

    #[test]
    fn test_merge_unions_lists_and_sums_counts() {
        let members = [
            system(1, 1, "Excel", "Acme", 0),
            system(2, 2, "Microsoft Excel", "Globex", 5),
        ];
        let plan = resolver().plan(&members, at(60)).unwrap();
        let merged = &plan.merged;

        assert_eq!(plan.canonical_member.get(), 1);
        assert_eq!(merged.text("name"), Some("Excel"));
        assert_eq!(merged.list("companies_using"), ["Acme", "Globex"]);
        assert_eq!(merged.source_count, 2);
        assert_eq!(merged.mentioned_in_sources.len(), 2);
        assert_eq!(merged.merged_entity_ids, vec![EntityId::new(1), EntityId::new(2)]);
        assert!(merged.is_consolidated);
        assert_eq!(merged.first_mentioned_at, at(0));
        assert_eq!(merged.last_mentioned_at, at(5));
        assert!(merged.id.is_unassigned());
        assert!(merged.check_invariants().is_ok());
    }

    #[test]
    fn test_confidence_is_monotone() {
        let mut a = system(1, 1, "Excel", "Acme", 0);
        let mut b = system(2, 2, "Excel", "Acme", 1);
        a.consensus_confidence = 0.95;
        b.consensus_confidence = 0.3;
        let plan = resolver().plan(&[a, b], at(2)).unwrap();
        assert!(plan.merged.consensus_confidence >= 0.95);
        assert!(plan.merged.consensus_confidence <= 1.0);
    }

    #[test]
    fn test_equal_confidences_merge_unchanged() {
        let a = system(1, 1, "Excel", "Acme", 0);
        let b = system(2, 2, "Excel", "Globex", 1);
        let plan = resolver().plan(&[a, b], at(2)).unwrap();
        assert_eq!(plan.merged.consensus_confidence, 0.7);
    }

    #[test]
    fn test_field_sources_are_unioned_per_field() {
        let a = system(1, 1, "Excel", "Acme", 0).with_field("category", "Spreadsheet");
        let b = system(2, 2, "Excel", "Globex", 5);
        let plan = resolver().plan(&[a, b], at(10)).unwrap();
        let merged = &plan.merged;
        assert_eq!(merged.sources_of("category"), BTreeSet::from([SourceId::new(1)]));
        assert_eq!(
            merged.sources_of("name"),
            BTreeSet::from([SourceId::new(1), SourceId::new(2)])
        );
        assert!(merged.sources_of("vendor").is_empty());
    }

    #[test]
    fn test_empty_canonical_scalar_falls_back_to_most_recent() {
        let a = system(1, 1, "Excel", "Acme", 0);
        let b = system(2, 2, "Excel", "Acme", 5).with_field("category", "Spreadsheet");
        let c = system(3, 3, "Excel", "Acme", 9).with_field("category", "Office suite");
        let plan = resolver().plan(&[a, b, c], at(10)).unwrap();
        assert_eq!(plan.merged.text("category"), Some("Office suite"));
    }

    #[test]
    fn test_contradiction_recorded_and_reported_once() {
        let a = system(1, 1, "Excel", "Acme", 0).with_field("criticality", "High");
        let b = system(2, 2, "Excel", "Acme", 5).with_field("criticality", "Low");
        let plan = resolver().plan(&[a, b], at(10)).unwrap();
        assert!(plan.merged.has_contradictions);
        assert_eq!(plan.new_contradictions.len(), 1);

        let mut merged = plan.merged;
        merged.id = EntityId::new(3);
        let c = system(4, 3, "Excel", "Acme", 20).with_field("criticality", "high");
        let again = resolver().plan(&[merged, c], at(30)).unwrap();
        assert!(again.merged.has_contradictions);
        assert!(again.new_contradictions.is_empty());
    }

    #[test]
    fn test_rejects_single_member_and_mixed_kinds() {
        let a = system(1, 1, "Excel", "Acme", 0);
        assert!(resolver().plan(&[a.clone()], at(0)).is_err());

        let mut kpi = Entity::mention(EntityKind::Kpi, SourceId::new(1), 0.7, at(0))
            .with_field("name", "DSO");
        kpi.id = EntityId::new(9);
        assert!(resolver().plan(&[a, kpi], at(0)).is_err());
    }
}
