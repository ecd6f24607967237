//! Entity types and the closed entity-kind vocabulary.
//!
//! Every consolidated fact is an [`Entity`] of exactly one [`EntityKind`].
//! The kind set is closed: type names coming from extraction output are
//! parsed into the enum at the boundary and anything else is rejected with
//! [`InvalidEntityTypeError`], so no free-form string ever selects storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contradiction::ContradictionDetail;
use crate::error::InvalidEntityTypeError;
use crate::schema::KindSchema;
use crate::source::SourceId;
use crate::value::FieldValue;

/// Store-assigned entity identifier.
///
/// Identifiers are allocated from one monotonically increasing sequence and
/// are never reused, so a snapshot or audit record can always refer to an id
/// even after the entity it names has been merged away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Placeholder for entities that have not been written yet.
    pub const UNASSIGNED: Self = Self(0);

    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the [`EntityId::UNASSIGNED`] placeholder.
    #[must_use]
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed vocabulary of entity kinds.
///
/// Each kind owns a static field schema (see [`crate::schema`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A problem the respondent described.
    PainPoint,
    /// A business process.
    Process,
    /// A software system or tool.
    System,
    /// A tracked metric.
    Kpi,
    /// Work that could be automated.
    AutomationCandidate,
    /// Wasted effort in a process.
    Inefficiency,
    /// How teams communicate.
    CommunicationChannel,
    /// Where a decision is made.
    DecisionPoint,
    /// Data moving between systems.
    DataFlow,
    /// Something that recurs on a schedule.
    TemporalPattern,
    /// A way things break.
    FailureMode,
    /// How a team is organised.
    TeamStructure,
    /// Missing know-how.
    KnowledgeGap,
    /// Something that works well.
    SuccessPattern,
    /// A spending limit.
    BudgetConstraint,
    /// Reliance on an outside party.
    ExternalDependency,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 16] = [
        Self::PainPoint,
        Self::Process,
        Self::System,
        Self::Kpi,
        Self::AutomationCandidate,
        Self::Inefficiency,
        Self::CommunicationChannel,
        Self::DecisionPoint,
        Self::DataFlow,
        Self::TemporalPattern,
        Self::FailureMode,
        Self::TeamStructure,
        Self::KnowledgeGap,
        Self::SuccessPattern,
        Self::BudgetConstraint,
        Self::ExternalDependency,
    ];

    /// Canonical snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PainPoint => "pain_point",
            Self::Process => "process",
            Self::System => "system",
            Self::Kpi => "kpi",
            Self::AutomationCandidate => "automation_candidate",
            Self::Inefficiency => "inefficiency",
            Self::CommunicationChannel => "communication_channel",
            Self::DecisionPoint => "decision_point",
            Self::DataFlow => "data_flow",
            Self::TemporalPattern => "temporal_pattern",
            Self::FailureMode => "failure_mode",
            Self::TeamStructure => "team_structure",
            Self::KnowledgeGap => "knowledge_gap",
            Self::SuccessPattern => "success_pattern",
            Self::BudgetConstraint => "budget_constraint",
            Self::ExternalDependency => "external_dependency",
        }
    }

    /// Parses a type name. Only exact canonical names are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEntityTypeError`] for anything outside the vocabulary,
    /// including names with surrounding whitespace or different casing.
    pub fn parse(value: &str) -> Result<Self, InvalidEntityTypeError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| InvalidEntityTypeError {
                value: value.to_string(),
            })
    }

    /// The static field schema for this kind.
    #[must_use]
    pub fn schema(self) -> &'static KindSchema {
        crate::schema::schema_for(self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = InvalidEntityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A typed pointer to an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Table the row lives in.
    pub kind: EntityKind,
    /// Row id within that table.
    pub id: EntityId,
}

impl EntityRef {
    /// Points at `id` of `kind`.
    #[must_use]
    pub const fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// One consolidated record of a given kind.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::{Entity, EntityKind, SourceId};
/// use chrono::Utc;
///
/// let entity = Entity::mention(EntityKind::System, SourceId::new(1), 0.8, Utc::now())
///     .with_field("name", "Excel");
/// assert_eq!(entity.primary_text(), "Excel");
/// assert_eq!(entity.source_count, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Which table this row lives in.
    pub kind: EntityKind,

    /// Row id, [`EntityId::UNASSIGNED`] until the store allocates one.
    pub id: EntityId,

    /// Type-specific canonical fields, validated against the kind schema.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,

    /// Sources that reported a non-empty value for each field.
    #[serde(default)]
    pub field_sources: BTreeMap<String, BTreeSet<SourceId>>,

    /// Number of independent mentions folded into this record.
    pub source_count: u32,

    /// Agreement across mentions, in `[0, 1]`.
    pub consensus_confidence: f64,

    /// Every source that mentioned this record.
    pub mentioned_in_sources: BTreeSet<SourceId>,

    /// Set once the record is the result of a merge.
    #[serde(default)]
    pub is_consolidated: bool,

    /// True iff `contradiction_details` is non-empty.
    #[serde(default)]
    pub has_contradictions: bool,

    /// Fields on which the merged mentions disagreed.
    #[serde(default)]
    pub contradiction_details: Vec<ContradictionDetail>,

    /// Ids absorbed into this record, including their own lineage.
    #[serde(default)]
    pub merged_entity_ids: Vec<EntityId>,

    /// Earliest mention across all merged members.
    pub first_mentioned_at: DateTime<Utc>,

    /// Latest mention across all merged members.
    pub last_mentioned_at: DateTime<Utc>,

    /// When the last merge into this record happened.
    #[serde(default)]
    pub consolidated_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Creates an unsaved single-source mention with no fields.
    #[must_use]
    pub fn mention(
        kind: EntityKind,
        source: SourceId,
        confidence: f64,
        mentioned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            id: EntityId::UNASSIGNED,
            fields: BTreeMap::new(),
            field_sources: BTreeMap::new(),
            source_count: 1,
            consensus_confidence: confidence,
            mentioned_in_sources: BTreeSet::from([source]),
            is_consolidated: false,
            has_contradictions: false,
            contradiction_details: Vec::new(),
            merged_entity_ids: Vec::new(),
            first_mentioned_at: mentioned_at,
            last_mentioned_at: mentioned_at,
            consolidated_at: None,
        }
    }

    /// Sets a field, replacing any previous value.
    ///
    /// A non-empty value is credited to every source this entity was
    /// mentioned in.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            self.field_sources.remove(&name);
        } else {
            self.field_sources
                .insert(name.clone(), self.mentioned_in_sources.clone());
        }
        self.fields.insert(name, value);
        self
    }

    /// Sources that reported `name`.
    ///
    /// Rows written before provenance was tracked fall back to every source
    /// of the entity when the field has a value.
    #[must_use]
    pub fn sources_of(&self, name: &str) -> BTreeSet<SourceId> {
        match self.field_sources.get(name) {
            Some(sources) => sources.clone(),
            None if self.field(name).is_some_and(|v| !v.is_empty()) => {
                self.mentioned_in_sources.clone()
            }
            None => BTreeSet::new(),
        }
    }

    /// Typed pointer to this row.
    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id)
    }

    /// Raw value of a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Text of a scalar field, if present and non-empty.
    #[must_use]
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(FieldValue::as_text)
            .filter(|s| !s.is_empty())
    }

    /// Items of a list field, or an empty slice.
    #[must_use]
    pub fn list(&self, name: &str) -> &[String] {
        self.fields
            .get(name)
            .and_then(FieldValue::as_list)
            .unwrap_or(&[])
    }

    /// The text used for similarity scoring (the schema's primary field).
    #[must_use]
    pub fn primary_text(&self) -> &str {
        self.text(self.kind.schema().primary).unwrap_or("")
    }

    /// Returns true if this entity already carries a mention from `source`.
    #[must_use]
    pub fn mentions(&self, source: SourceId) -> bool {
        self.mentioned_in_sources.contains(&source)
    }

    /// Checks the row-level invariants that every stored entity must satisfy.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a human-readable reason.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.source_count == 0 {
            return Err(format!("{}: source_count must be >= 1", self.entity_ref()));
        }
        if !(0.0..=1.0).contains(&self.consensus_confidence) {
            return Err(format!(
                "{}: consensus_confidence {} outside [0, 1]",
                self.entity_ref(),
                self.consensus_confidence
            ));
        }
        if self.mentioned_in_sources.is_empty() {
            return Err(format!(
                "{}: mentioned_in_sources must not be empty",
                self.entity_ref()
            ));
        }
        if let Some((field, _)) = self
            .field_sources
            .iter()
            .find(|(_, sources)| !sources.is_subset(&self.mentioned_in_sources))
        {
            return Err(format!(
                "{}: field {field} credits a source outside mentioned_in_sources",
                self.entity_ref()
            ));
        }
        if self.has_contradictions == self.contradiction_details.is_empty() {
            return Err(format!(
                "{}: has_contradictions disagrees with contradiction_details",
                self.entity_ref()
            ));
        }
        Ok(())
    }
}

/// One record as delivered by the extraction pipeline.
///
/// The type name is kept as a raw string until validation so that a bad name
/// fails the whole call instead of being silently dropped.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::ExtractedEntity;
///
/// let record = ExtractedEntity::new("pain_point")
///     .field("description", "manual reconciliation")
///     .field("severity", "High")
///     .confidence(0.9);
/// assert_eq!(record.entity_type, "pain_point");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    /// Raw type name, validated by [`EntityKind::parse`].
    pub entity_type: String,

    /// Field values as extracted, normalized against the schema on ingest.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,

    /// Extractor confidence. Falls back to the configured default.
    #[serde(default)]
    pub confidence: Option<f64>,

    /// When the mention was extracted. Defaults to the run's clock.
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
}

impl ExtractedEntity {
    /// Starts a record of the given type with no fields.
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            confidence: None,
            extracted_at: None,
        }
    }

    /// Sets a field value.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the extractor confidence.
    #[must_use]
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Sets the extraction time.
    #[must_use]
    pub fn extracted_at(mut self, at: DateTime<Utc>) -> Self {
        self.extracted_at = Some(at);
        self
    }

    /// Validates this record and turns it into an unsaved single-source mention.
    ///
    /// `company` is appended to the kind's company list field when the schema
    /// has one, so every mention records which organisation reported it.
    ///
    /// # Errors
    ///
    /// - [`InvalidEntityTypeError`] (wrapped) for an unknown type name
    /// - [`ValidationError`] for schema violations or an out-of-range confidence
    pub fn into_mention(
        self,
        source: SourceId,
        company: Option<&str>,
        default_confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<Entity, crate::error::ConsolidationError> {
        let kind = EntityKind::parse(&self.entity_type)?;
        let confidence = crate::confidence::validate(self.confidence.unwrap_or(default_confidence))?;
        let schema = kind.schema();
        let mut fields = schema.normalize(self.fields)?;

        if let (Some(company), Some(list_field)) = (company, schema.company_field) {
            let company = company.trim();
            if !company.is_empty() {
                let entry = fields
                    .entry(list_field.to_string())
                    .or_insert_with(|| FieldValue::List(Vec::new()));
                if let FieldValue::List(items) = entry {
                    if !items.iter().any(|c| c.eq_ignore_ascii_case(company)) {
                        items.push(company.to_string());
                    }
                }
            }
        }

        let mut entity = Entity::mention(kind, source, confidence, self.extracted_at.unwrap_or(now));
        entity.field_sources = fields
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, _)| (name.clone(), BTreeSet::from([source])))
            .collect();
        entity.fields = fields;
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()).unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn test_kind_rejects_injection_and_near_misses() {
        for bad in [
            "pain_point; DROP TABLE pain_points",
            "Pain_Point",
            " system",
            "systems",
            "",
            "system--",
        ] {
            let err = EntityKind::parse(bad).unwrap_err();
            assert_eq!(err.value, bad);
        }
    }

    #[test]
    fn test_kind_serde_uses_snake_case() {
        let json = serde_json::to_string(&EntityKind::AutomationCandidate).unwrap();
        assert_eq!(json, "\"automation_candidate\"");
    }

    #[test]
    fn test_into_mention_adds_company_once() {
        let record = ExtractedEntity::new("system")
            .field("name", "Excel")
            .field("companies_using", vec!["Acme"]);
        let entity = record
            .into_mention(SourceId::new(1), Some("acme"), 0.7, Utc::now())
            .unwrap();
        assert_eq!(entity.list("companies_using"), ["Acme".to_string()]);
        assert_eq!(entity.consensus_confidence, 0.7);
        assert!(entity.mentions(SourceId::new(1)));
        assert_eq!(entity.sources_of("name"), BTreeSet::from([SourceId::new(1)]));
        assert!(entity.sources_of("category").is_empty());
    }

    #[test]
    fn test_into_mention_rejects_unknown_type() {
        let err = ExtractedEntity::new("widget")
            .field("name", "x")
            .into_mention(SourceId::new(1), None, 0.5, Utc::now())
            .unwrap_err();
        assert!(err.is_invalid_entity_type());
    }

    #[test]
    fn test_invariants_catch_bad_rows() {
        let mut entity = Entity::mention(EntityKind::System, SourceId::new(1), 0.5, Utc::now())
            .with_field("name", "Jira");
        assert!(entity.check_invariants().is_ok());

        entity.source_count = 0;
        assert!(entity.check_invariants().is_err());

        entity.source_count = 1;
        entity.consensus_confidence = 1.2;
        assert!(entity.check_invariants().is_err());

        entity.consensus_confidence = 0.4;
        entity.has_contradictions = true;
        assert!(entity.check_invariants().is_err());

        entity.has_contradictions = false;
        entity
            .field_sources
            .insert("name".to_string(), BTreeSet::from([SourceId::new(7)]));
        assert!(entity.check_invariants().is_err());
    }
}
