//! Consensus confidence.
//!
//! A consolidated entity's confidence reflects how much independent
//! corroboration it has. Merging combines member confidences as a
//! mention-weighted average, optionally adds a bonus per additional distinct
//! source, and never lets the result fall below the strongest member.

use crate::error::ValidationError;

/// Confidence assigned to mentions that arrive without one.
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Checks that a confidence value is finite and within `[0, 1]`.
///
/// # Errors
///
/// Returns `ValidationError::ConfidenceOutOfRange` otherwise.
pub fn validate(value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::ConfidenceOutOfRange { value })
    }
}

/// One member's contribution to a consensus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    /// The member's consensus confidence.
    pub confidence: f64,
    /// Mentions behind this confidence (the member's `source_count`).
    pub weight: u32,
}

/// Computes the consensus confidence of a merged cluster.
///
/// `distinct_sources` is the size of the merged `mentioned_in_sources`;
/// each source beyond the first adds `corroboration_bonus`. The result is
/// capped at 1.0 and floored at the maximum member confidence.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::confidence::{consensus, Contribution};
///
/// let merged = consensus(
///     &[
///         Contribution { confidence: 0.6, weight: 3 },
///         Contribution { confidence: 0.9, weight: 1 },
///     ],
///     2,
///     0.0,
/// );
/// // Weighted average is 0.675, but never below the strongest member.
/// assert_eq!(merged, 0.9);
/// ```
#[must_use]
pub fn consensus(members: &[Contribution], distinct_sources: usize, corroboration_bonus: f64) -> f64 {
    let mut weighted = 0.0f64;
    let mut total_weight = 0.0f64;
    let mut strongest = 0.0f64;

    for member in members {
        let confidence = member.confidence.clamp(0.0, 1.0);
        let weight = f64::from(member.weight.max(1));
        weighted += confidence * weight;
        total_weight += weight;
        strongest = strongest.max(confidence);
    }

    if total_weight <= 0.0 {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let extra_sources = distinct_sources.saturating_sub(1) as f64;
    let average = weighted / total_weight;
    let boosted = average + corroboration_bonus.max(0.0) * extra_sources;

    boosted.max(strongest).min(1.0)
}
