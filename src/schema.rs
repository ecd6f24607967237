//! Static field schemas for every entity kind.
//!
//! A schema names the primary text field (the one similarity is computed
//! over), which fields hold lists, and which scalar fields are expected to be
//! single-valued. Single-valued fields are the default contradiction fields:
//! two mentions disagreeing on them is flagged for review.

use std::collections::BTreeMap;

use crate::entity::EntityKind;
use crate::error::ValidationError;
use crate::value::FieldValue;

/// Shape of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Text or number.
    Scalar,
    /// List of strings; merged by union.
    List,
}

/// One field in a kind schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name as it appears in records.
    pub name: &'static str,
    /// Scalar or list.
    pub shape: FieldShape,
    /// Mentions must agree on this field or the merge records a contradiction.
    pub single_valued: bool,
}

const fn scalar(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        shape: FieldShape::Scalar,
        single_valued: false,
    }
}

const fn single(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        shape: FieldShape::Scalar,
        single_valued: true,
    }
}

const fn list(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        shape: FieldShape::List,
        single_valued: false,
    }
}

/// The field schema of one entity kind.
#[derive(Debug)]
pub struct KindSchema {
    /// The kind this schema describes.
    pub kind: EntityKind,
    /// Primary text field used for matching. Always a scalar in `fields`.
    pub primary: &'static str,
    /// List field that accumulates reporting companies, if the kind has one.
    pub company_field: Option<&'static str>,
    /// Every field the kind accepts.
    pub fields: &'static [FieldSpec],
}

impl KindSchema {
    /// Looks up a field by name.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of the single-valued fields, in schema order.
    pub fn single_valued_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.single_valued)
            .map(|f| f.name)
    }

    /// Validates and normalizes raw fields from an extracted record.
    ///
    /// - unknown field names are rejected
    /// - text is trimmed, empty values are dropped
    /// - a single string in a list field is promoted to a one-item list
    /// - list items are trimmed and de-duplicated case-insensitively
    /// - the primary field must end up non-empty text
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn normalize(
        &self,
        raw: BTreeMap<String, FieldValue>,
    ) -> Result<BTreeMap<String, FieldValue>, ValidationError> {
        let mut out = BTreeMap::new();
        for (name, value) in raw {
            let Some(spec) = self.spec(&name) else {
                return Err(ValidationError::UnknownField {
                    kind: self.kind,
                    field: name,
                });
            };

            let normalized = match (spec.shape, value) {
                (_, FieldValue::Null) => None,
                (FieldShape::Scalar, FieldValue::Text(s)) => {
                    let s = s.trim();
                    (!s.is_empty()).then(|| FieldValue::Text(s.to_string()))
                }
                (FieldShape::Scalar, FieldValue::Number(n)) => Some(FieldValue::Number(n)),
                (FieldShape::Scalar, FieldValue::List(_)) => {
                    return Err(ValidationError::FieldShapeMismatch {
                        kind: self.kind,
                        field: name,
                        expected: "scalar",
                    });
                }
                (FieldShape::List, FieldValue::Text(s)) => {
                    let items = dedup_items(std::iter::once(s));
                    (!items.is_empty()).then_some(FieldValue::List(items))
                }
                (FieldShape::List, FieldValue::List(items)) => {
                    let items = dedup_items(items);
                    (!items.is_empty()).then_some(FieldValue::List(items))
                }
                (FieldShape::List, FieldValue::Number(_)) => {
                    return Err(ValidationError::FieldShapeMismatch {
                        kind: self.kind,
                        field: name,
                        expected: "list",
                    });
                }
            };

            if let Some(value) = normalized {
                out.insert(name, value);
            }
        }

        match out.get(self.primary) {
            Some(FieldValue::Text(_)) => Ok(out),
            _ => Err(ValidationError::EmptyPrimaryField {
                kind: self.kind,
                field: self.primary,
            }),
        }
    }
}

/// Trims, drops blanks and removes case-insensitive duplicates, keeping the
/// first spelling seen.
pub(crate) fn dedup_items(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if !out.iter().any(|seen| seen.eq_ignore_ascii_case(item)) {
            out.push(item.to_string());
        }
    }
    out
}

static PAIN_POINT: KindSchema = KindSchema {
    kind: EntityKind::PainPoint,
    primary: "description",
    company_field: Some("companies"),
    fields: &[
        scalar("description"),
        single("severity"),
        single("frequency"),
        scalar("impact"),
        scalar("category"),
        list("affected_roles"),
        list("companies"),
    ],
};

static PROCESS: KindSchema = KindSchema {
    kind: EntityKind::Process,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("description"),
        single("frequency"),
        scalar("owner"),
        list("systems_used"),
        list("companies"),
    ],
};

static SYSTEM: KindSchema = KindSchema {
    kind: EntityKind::System,
    primary: "name",
    company_field: Some("companies_using"),
    fields: &[
        scalar("name"),
        scalar("category"),
        scalar("description"),
        single("criticality"),
        list("companies_using"),
        list("users"),
    ],
};

static KPI: KindSchema = KindSchema {
    kind: EntityKind::Kpi,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("definition"),
        single("target_value"),
        single("measurement_frequency"),
        list("companies"),
    ],
};

static AUTOMATION_CANDIDATE: KindSchema = KindSchema {
    kind: EntityKind::AutomationCandidate,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("description"),
        single("complexity"),
        single("estimated_impact"),
        list("systems_involved"),
        list("companies"),
    ],
};

static INEFFICIENCY: KindSchema = KindSchema {
    kind: EntityKind::Inefficiency,
    primary: "description",
    company_field: Some("companies"),
    fields: &[
        scalar("description"),
        scalar("category"),
        single("time_wasted"),
        list("companies"),
    ],
};

static COMMUNICATION_CHANNEL: KindSchema = KindSchema {
    kind: EntityKind::CommunicationChannel,
    primary: "channel_name",
    company_field: Some("companies"),
    fields: &[
        scalar("channel_name"),
        scalar("purpose"),
        single("frequency"),
        list("participants"),
        list("companies"),
    ],
};

static DECISION_POINT: KindSchema = KindSchema {
    kind: EntityKind::DecisionPoint,
    primary: "decision",
    company_field: Some("companies"),
    fields: &[
        scalar("decision"),
        single("decision_maker"),
        scalar("criteria"),
        list("companies"),
    ],
};

static DATA_FLOW: KindSchema = KindSchema {
    kind: EntityKind::DataFlow,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("source_system"),
        scalar("target_system"),
        single("frequency"),
        list("data_types"),
        list("companies"),
    ],
};

static TEMPORAL_PATTERN: KindSchema = KindSchema {
    kind: EntityKind::TemporalPattern,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("description"),
        single("timing"),
        list("companies"),
    ],
};

static FAILURE_MODE: KindSchema = KindSchema {
    kind: EntityKind::FailureMode,
    primary: "description",
    company_field: Some("companies"),
    fields: &[
        scalar("description"),
        single("impact"),
        single("frequency"),
        scalar("recovery"),
        list("companies"),
    ],
};

static TEAM_STRUCTURE: KindSchema = KindSchema {
    kind: EntityKind::TeamStructure,
    primary: "team_name",
    company_field: Some("companies"),
    fields: &[
        scalar("team_name"),
        scalar("size"),
        single("reports_to"),
        list("roles"),
        list("companies"),
    ],
};

static KNOWLEDGE_GAP: KindSchema = KindSchema {
    kind: EntityKind::KnowledgeGap,
    primary: "description",
    company_field: Some("companies"),
    fields: &[
        scalar("description"),
        scalar("area"),
        single("severity"),
        list("affected_roles"),
        list("companies"),
    ],
};

static SUCCESS_PATTERN: KindSchema = KindSchema {
    kind: EntityKind::SuccessPattern,
    primary: "description",
    company_field: Some("companies"),
    fields: &[scalar("description"), scalar("impact"), list("companies")],
};

static BUDGET_CONSTRAINT: KindSchema = KindSchema {
    kind: EntityKind::BudgetConstraint,
    primary: "description",
    company_field: Some("companies"),
    fields: &[scalar("description"), single("amount"), list("companies")],
};

static EXTERNAL_DEPENDENCY: KindSchema = KindSchema {
    kind: EntityKind::ExternalDependency,
    primary: "name",
    company_field: Some("companies"),
    fields: &[
        scalar("name"),
        scalar("dependency_type"),
        single("criticality"),
        list("companies"),
    ],
};

pub(crate) fn schema_for(kind: EntityKind) -> &'static KindSchema {
    match kind {
        EntityKind::PainPoint => &PAIN_POINT,
        EntityKind::Process => &PROCESS,
        EntityKind::System => &SYSTEM,
        EntityKind::Kpi => &KPI,
        EntityKind::AutomationCandidate => &AUTOMATION_CANDIDATE,
        EntityKind::Inefficiency => &INEFFICIENCY,
        EntityKind::CommunicationChannel => &COMMUNICATION_CHANNEL,
        EntityKind::DecisionPoint => &DECISION_POINT,
        EntityKind::DataFlow => &DATA_FLOW,
        EntityKind::TemporalPattern => &TEMPORAL_PATTERN,
        EntityKind::FailureMode => &FAILURE_MODE,
        EntityKind::TeamStructure => &TEAM_STRUCTURE,
        EntityKind::KnowledgeGap => &KNOWLEDGE_GAP,
        EntityKind::SuccessPattern => &SUCCESS_PATTERN,
        EntityKind::BudgetConstraint => &BUDGET_CONSTRAINT,
        EntityKind::ExternalDependency => &EXTERNAL_DEPENDENCY,
    }
}
