//! # kyro-consolidate
//!
//! A consolidation engine for knowledge graphs built from many independently
//! extracted source documents. The same real-world fact ("we reconcile
//! invoices by hand in Excel") is usually mentioned in several interviews;
//! this crate folds those mentions into one canonical record while keeping
//! full provenance and the ability to undo any merge.
//!
//! ## Core Concepts
//!
//! - **Entity**: one consolidated fact of a closed [`EntityKind`]
//! - **Similarity**: lexical plus optional semantic scoring of primary text
//! - **Merge**: confidence-weighted field merge with contradiction tracking
//! - **Audit**: one record and one snapshot per absorbed entity, per merge;
//!   any merge can be rolled back
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use kyro_consolidate::{
//!     ConsolidationAgent, ConsolidationConfig, EntityKind, EntityStore, ExtractedEntity,
//!     NewSource,
//! };
//!
//! let config = ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75);
//! let agent = ConsolidationAgent::new(Arc::new(EntityStore::in_memory()), config)?;
//!
//! let first = agent.register_source(NewSource::new("Interview 1").company("Acme"))?;
//! let second = agent.register_source(NewSource::new("Interview 2").company("Globex"))?;
//!
//! agent.consolidate(vec![ExtractedEntity::new("system").field("name", "Excel")], first)?;
//! let result = agent.consolidate(
//!     vec![ExtractedEntity::new("system").field("name", "Microsoft Excel")],
//!     second,
//! )?;
//!
//! assert_eq!(result.stats.entities_merged, 1);
//! let merged = &result.entities_of(EntityKind::System)[0];
//! assert_eq!(merged.source_count, 2);
//!
//! // Every merge can be undone.
//! agent.rollback(result.audits[0], "reviewed: different products")?;
//! # Ok::<(), kyro_consolidate::ConsolidationError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod audit;
pub mod confidence;
pub mod contradiction;
pub mod entity;
pub mod error;
pub mod relationship;
pub mod schema;
pub mod source;
pub mod time;
pub mod value;

// Policy and scoring
pub mod config;
pub mod embedding;
pub mod pattern;
pub mod similarity;

// Storage and orchestration
pub mod consolidation;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use audit::{AuditFilter, AuditId, AuditRecord, EntitySnapshot, RunId, SnapshotId};
pub use config::{ConsolidationConfig, ScoreCombination};
pub use consolidation::{
    CancelToken, ConsolidationAgent, ConsolidationResult, ConsolidationStats, RollbackOutcome,
};
pub use contradiction::{ContradictionDetail, ContradictionDetectedWarning};
pub use embedding::{EmbeddingProvider, LexicalHashEmbedder};
pub use entity::{Entity, EntityId, EntityKind, EntityRef, ExtractedEntity};
pub use error::{
    ConsolidationError, InvalidEntityTypeError, KcResult, RollbackError,
    SimilarityComputationError, ValidationError,
};
pub use pattern::{Pattern, PatternType};
pub use relationship::{NewRelationship, Relationship, RelationshipId};
pub use similarity::SimilarityMatcher;
pub use source::{NewSource, Source, SourceId};
pub use storage::{EntityFilter, EntityStore, StorageError, Transaction};
pub use value::FieldValue;
