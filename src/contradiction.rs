//! Contradiction tracking for single-valued fields.
//!
//! Contradictions are explicit data, not errors. When mentions merged into
//! one entity disagree on a field that should have exactly one value (a
//! severity, a criticality), the entity is flagged and a
//! [`ContradictionDetail`] records every value seen and which sources
//! reported them. The merge still goes ahead; the flag feeds a human
//! review queue.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityRef};
use crate::source::SourceId;

/// One disagreement on one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContradictionDetail {
    /// Name of the disagreeing field.
    pub field: String,
    /// Distinct values, in the order they were first mentioned.
    pub values: Vec<String>,
    /// Sources that reported any of the values, ascending.
    pub sources: Vec<SourceId>,
}

impl ContradictionDetail {
    /// Returns true if every value in `other` already appears here.
    #[must_use]
    pub fn has_all_values_of(&self, other: &Self) -> bool {
        other
            .values
            .iter()
            .all(|v| self.values.iter().any(|mine| mine.eq_ignore_ascii_case(v)))
    }

    /// Returns true if `other` adds no value or source this detail lacks.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.field == other.field
            && self.has_all_values_of(other)
            && other.sources.iter().all(|s| self.sources.contains(s))
    }
}

/// Non-fatal signal raised when a merge records a contradiction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContradictionDetectedWarning {
    /// The merged entity carrying the contradiction.
    pub entity: EntityRef,
    /// The field, values and sources involved.
    pub detail: ContradictionDetail,
}

impl fmt::Display for ContradictionDetectedWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contradiction on {}.{}: [{}] from sources [{}]",
            self.entity,
            self.detail.field,
            self.detail.values.join(", "),
            self.detail
                .sources
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[derive(Default)]
struct FieldObservations {
    // (comparison key, display value)
    values: Vec<(String, String)>,
    sources: BTreeSet<SourceId>,
}

impl FieldObservations {
    fn observe(&mut self, display: &str, sources: impl IntoIterator<Item = SourceId>) {
        let key = display.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if key.is_empty() {
            return;
        }
        if !self.values.iter().any(|(k, _)| *k == key) {
            self.values.push((key, display.to_string()));
        }
        self.sources.extend(sources);
    }
}

/// Detects contradictions across the members of a cluster.
///
/// `members` must be in chronological order (earliest first mention first)
/// so that value order is reproducible. Contradictions the members already
/// carry for the same field are folded in, so history survives re-merges.
#[must_use]
pub fn detect(members: &[&Entity], fields: &[&str]) -> Vec<ContradictionDetail> {
    let mut out = Vec::new();

    for &field in fields {
        let mut observed = FieldObservations::default();

        for member in members {
            for prior in member.contradiction_details.iter().filter(|d| d.field == field) {
                for value in &prior.values {
                    observed.observe(value, prior.sources.iter().copied());
                }
            }
            if let Some(value) = member.field(field).filter(|v| !v.is_empty() && !v.is_list()) {
                observed.observe(&value.to_string(), member.sources_of(field));
            }
        }

        if observed.values.len() >= 2 {
            out.push(ContradictionDetail {
                field: field.to_string(),
                values: observed.values.into_iter().map(|(_, display)| display).collect(),
                sources: observed.sources.into_iter().collect(),
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use chrono::{Duration, Utc};

    fn pain(source: u64, severity: &str, offset_minutes: i64) -> Entity {
        Entity::mention(
            EntityKind::PainPoint,
            SourceId::new(source),
            0.8,
            Utc::now() + Duration::minutes(offset_minutes),
        )
        .with_field("description", "manual reconciliation")
        .with_field("severity", severity)
    }

    #[test]
    fn test_detects_disagreement_in_mention_order() {
        let a = pain(1, "High", 0);
        let b = pain(2, "Critical", 5);
        let details = detect(&[&a, &b], &["severity", "frequency"]);
        assert_eq!(
            details,
            vec![ContradictionDetail {
                field: "severity".to_string(),
                values: vec!["High".to_string(), "Critical".to_string()],
                sources: vec![SourceId::new(1), SourceId::new(2)],
            }]
        );
    }

    #[test]
    fn test_agreement_is_case_insensitive() {
        let a = pain(1, "High", 0);
        let b = pain(2, "high", 5);
        assert!(detect(&[&a, &b], &["severity"]).is_empty());
    }

    #[test]
    fn test_prior_details_are_carried_forward() {
        let mut merged = pain(1, "High", 0);
        merged.has_contradictions = true;
        merged.contradiction_details.push(ContradictionDetail {
            field: "severity".to_string(),
            values: vec!["High".to_string(), "Critical".to_string()],
            sources: vec![SourceId::new(1), SourceId::new(2)],
        });
        let late = pain(3, "Low", 10);

        let details = detect(&[&merged, &late], &["severity"]);
        assert_eq!(details[0].values, vec!["High", "Critical", "Low"]);
        assert_eq!(
            details[0].sources,
            vec![SourceId::new(1), SourceId::new(2), SourceId::new(3)]
        );
        assert!(details[0].covers(&merged.contradiction_details[0]));
        assert!(!merged.contradiction_details[0].covers(&details[0]));
    }

    #[test]
    fn test_only_sources_that_reported_the_field_are_credited() {
        let mut merged = pain(1, "High", 0);
        merged.mentioned_in_sources.insert(SourceId::new(2));
        merged.source_count = 2;
        let late = pain(3, "Critical", 10);

        let details = detect(&[&merged, &late], &["severity"]);
        assert_eq!(details[0].sources, vec![SourceId::new(1), SourceId::new(3)]);
    }
}
