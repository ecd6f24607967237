//! Consolidation policy.
//!
//! Everything that is a judgement call rather than a correctness rule lives
//! here: match thresholds, how lexical and semantic signals are combined,
//! which fields count as contradictions. Per-kind maps are keyed by the
//! kind's snake_case name so the same file reads naturally as TOML:
//!
//! ```toml
//! default_threshold = 0.8
//! top_k = 5
//!
//! [thresholds]
//! system = 0.85
//! pain_point = 0.75
//!
//! [combination.pain_point]
//! strategy = "weighted"
//! semantic_weight = 0.6
//!
//! [contradiction_fields]
//! kpi = ["target_value"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::confidence::DEFAULT_CONFIDENCE;
use crate::entity::EntityKind;
use crate::error::{KcResult, ValidationError};

/// How the lexical and semantic scores become one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ScoreCombination {
    /// The higher of the two.
    Max,
    /// `semantic_weight * semantic + (1 - semantic_weight) * lexical`.
    Weighted { semantic_weight: f64 },
}

impl Default for ScoreCombination {
    fn default() -> Self {
        Self::Max
    }
}

impl ScoreCombination {
    /// Combines the two signals. Without a semantic score the lexical score
    /// is used as-is.
    #[must_use]
    pub fn combine(self, lexical: f64, semantic: Option<f64>) -> f64 {
        let Some(semantic) = semantic else {
            return lexical;
        };
        let combined = match self {
            Self::Max => lexical.max(semantic),
            Self::Weighted { semantic_weight } => {
                semantic_weight * semantic + (1.0 - semantic_weight) * lexical
            }
        };
        combined.clamp(0.0, 1.0)
    }
}

fn default_thresholds() -> BTreeMap<String, f64> {
    BTreeMap::from([
        (EntityKind::System.as_str().to_string(), 0.85),
        (EntityKind::PainPoint.as_str().to_string(), 0.75),
    ])
}

/// Tunables for a [`ConsolidationAgent`](crate::ConsolidationAgent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Match threshold for kinds without an override.
    pub default_threshold: f64,

    /// Per-kind match thresholds.
    pub thresholds: BTreeMap<String, f64>,

    /// Combination used for kinds without an override.
    pub default_combination: ScoreCombination,

    /// Per-kind score combination.
    pub combination: BTreeMap<String, ScoreCombination>,

    /// Per-kind single-valued fields checked for contradictions. Kinds not
    /// listed use their schema's single-valued fields.
    pub contradiction_fields: BTreeMap<String, Vec<String>>,

    /// Weight of the overlap coefficient in the lexical score, so that a
    /// name fully contained in a longer one ("Excel" in "Microsoft Excel")
    /// still scores high.
    pub containment_weight: f64,

    /// Maximum candidates considered per incoming entity.
    pub top_k: usize,

    /// Confidence given to records that arrive without one.
    pub default_confidence: f64,

    /// Added to the consensus confidence per corroborating source.
    ///
    /// Off by default, so identical confidences merge to that same value.
    pub corroboration_bonus: f64,

    /// Per-call embedding timeout.
    pub embedding_timeout_ms: u64,

    /// Maximum cached embeddings; 0 disables the cache.
    pub embedding_cache_capacity: usize,

    /// Process different kinds of one batch on parallel threads.
    pub parallel_kinds: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.80,
            thresholds: default_thresholds(),
            default_combination: ScoreCombination::Max,
            combination: BTreeMap::new(),
            contradiction_fields: BTreeMap::new(),
            containment_weight: 0.8,
            top_k: 5,
            default_confidence: DEFAULT_CONFIDENCE,
            corroboration_bonus: 0.0,
            embedding_timeout_ms: 2_000,
            embedding_cache_capacity: 4_096,
            parallel_kinds: true,
        }
    }
}

fn unit_interval(name: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidConfig {
            reason: format!("{name} must be within [0, 1] (got {value})"),
        })
    }
}

fn known_kind(section: &str, key: &str) -> Result<EntityKind, ValidationError> {
    EntityKind::parse(key).map_err(|e| ValidationError::InvalidConfig {
        reason: format!("{section}: {e}"),
    })
}

impl ConsolidationConfig {
    /// Match threshold for `kind`.
    #[must_use]
    pub fn threshold_for(&self, kind: EntityKind) -> f64 {
        self.thresholds
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Sets a per-kind threshold.
    #[must_use]
    pub fn with_threshold(mut self, kind: EntityKind, threshold: f64) -> Self {
        self.thresholds.insert(kind.as_str().to_string(), threshold);
        self
    }

    /// Score combination for `kind`, falling back to the default.
    #[must_use]
    pub fn combination_for(&self, kind: EntityKind) -> ScoreCombination {
        self.combination
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_combination)
    }

    /// Sets a per-kind score combination.
    #[must_use]
    pub fn with_combination(mut self, kind: EntityKind, combination: ScoreCombination) -> Self {
        self.combination.insert(kind.as_str().to_string(), combination);
        self
    }

    /// Fields checked for contradictions when merging `kind`.
    #[must_use]
    pub fn contradiction_fields_for(&self, kind: EntityKind) -> Vec<String> {
        self.contradiction_fields.get(kind.as_str()).map_or_else(
            || kind.schema().single_valued_fields().map(str::to_string).collect(),
            Clone::clone,
        )
    }

    /// Checks ranges and that every per-kind key names a known kind.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` describing the first problem.
    pub fn validate(self) -> Result<Self, ValidationError> {
        unit_interval("default_threshold", self.default_threshold)?;
        for (key, threshold) in &self.thresholds {
            known_kind("thresholds", key)?;
            unit_interval(&format!("thresholds.{key}"), *threshold)?;
        }
        if let ScoreCombination::Weighted { semantic_weight } = self.default_combination {
            unit_interval("default_combination.semantic_weight", semantic_weight)?;
        }
        for (key, combination) in &self.combination {
            known_kind("combination", key)?;
            if let ScoreCombination::Weighted { semantic_weight } = combination {
                unit_interval(&format!("combination.{key}.semantic_weight"), *semantic_weight)?;
            }
        }
        for (key, fields) in &self.contradiction_fields {
            let kind = known_kind("contradiction_fields", key)?;
            let schema = kind.schema();
            if let Some(unknown) = fields.iter().find(|f| schema.spec(f).is_none()) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("contradiction_fields.{key}: '{unknown}' is not a {kind} field"),
                });
            }
        }
        unit_interval("containment_weight", self.containment_weight)?;
        unit_interval("default_confidence", self.default_confidence)?;
        unit_interval("corroboration_bonus", self.corroboration_bonus)?;
        if self.top_k == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "top_k must be at least 1".to_string(),
            });
        }
        if self.embedding_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "embedding_timeout_ms must be positive".to_string(),
            });
        }
        Ok(self)
    }

    /// Parses and validates a TOML document. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for malformed TOML or out-of-range values.
    pub fn from_toml_str(input: &str) -> KcResult<Self> {
        let parsed: Self = toml::from_str(input).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        Ok(parsed.validate()?)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> KcResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&input)
    }
}
