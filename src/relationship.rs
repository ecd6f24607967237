//! Typed, weighted edges between entities.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;
use crate::error::ValidationError;
use crate::source::SourceId;

/// Store-assigned relationship identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(u64);

impl RelationshipId {
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
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(source) -[relation_type, strength]-> (target)`.
///
/// Both endpoints must be live entities at every commit boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Store-assigned id.
    pub id: RelationshipId,
    /// Tail of the edge.
    pub source: EntityRef,
    /// Head of the edge.
    pub target: EntityRef,
    /// Lowercase snake_case label.
    pub relation_type: String,
    /// Strength in `[0, 1]`.
    pub strength: f64,
    /// Sources that reported this edge.
    #[serde(default)]
    pub mentioned_in_sources: BTreeSet<SourceId>,
}

/// Identity of an edge for duplicate detection: same endpoints, same type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    /// Tail of the edge.
    pub source: EntityRef,
    /// Edge label.
    pub relation_type: String,
    /// Head of the edge.
    pub target: EntityRef,
}

impl Relationship {
    /// Identity used to collapse duplicate edges.
    #[must_use]
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source,
            relation_type: self.relation_type.clone(),
            target: self.target,
        }
    }

    /// Returns true if either endpoint is `entity`.
    #[must_use]
    pub fn touches(&self, entity: EntityRef) -> bool {
        self.source == entity || self.target == entity
    }

    /// Returns true if both endpoints are the same entity.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

fn relation_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("relation type pattern is valid"))
}

/// An edge that has not been stored yet.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::{EntityId, EntityKind, EntityRef, NewRelationship};
///
/// let edge = NewRelationship::new(
///     EntityRef::new(EntityKind::PainPoint, EntityId::new(1)),
///     "caused_by",
///     EntityRef::new(EntityKind::System, EntityId::new(2)),
/// )
/// .strength(0.6);
/// assert!(edge.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewRelationship {
    /// Tail of the edge.
    pub source: EntityRef,
    /// Head of the edge.
    pub target: EntityRef,
    /// Edge label, checked by [`NewRelationship::validate`].
    pub relation_type: String,
    /// Strength in `[0, 1]`. Defaults to 0.5.
    pub strength: f64,
    /// Sources that reported this edge.
    pub mentioned_in_sources: BTreeSet<SourceId>,
}

impl NewRelationship {
    /// An edge of default strength with no sources.
    #[must_use]
    pub fn new(source: EntityRef, relation_type: impl Into<String>, target: EntityRef) -> Self {
        Self {
            source,
            target,
            relation_type: relation_type.into(),
            strength: 0.5,
            mentioned_in_sources: BTreeSet::new(),
        }
    }

    /// Sets the strength.
    #[must_use]
    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    /// Credits a reporting source.
    #[must_use]
    pub fn mentioned_in(mut self, source: SourceId) -> Self {
        self.mentioned_in_sources.insert(source);
        self
    }

    /// Validates the relation label and strength.
    ///
    /// Relation types are lowercase snake_case identifiers of at most 64
    /// characters.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRelationType` or `StrengthOutOfRange`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !relation_type_pattern().is_match(&self.relation_type) {
            return Err(ValidationError::InvalidRelationType {
                value: self.relation_type.clone(),
            });
        }
        if !self.strength.is_finite() || !(0.0..=1.0).contains(&self.strength) {
            return Err(ValidationError::StrengthOutOfRange {
                value: self.strength,
            });
        }
        Ok(())
    }

    /// Validates and assigns the id.
    ///
    /// # Errors
    ///
    /// See [`NewRelationship::validate`].
    pub fn into_relationship(self, id: RelationshipId) -> Result<Relationship, ValidationError> {
        self.validate()?;
        Ok(Relationship {
            id,
            source: self.source,
            target: self.target,
            relation_type: self.relation_type,
            strength: self.strength,
            mentioned_in_sources: self.mentioned_in_sources,
        })
    }
}
