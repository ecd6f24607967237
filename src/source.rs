//! Provenance: the source documents (interviews) entities are extracted from.
//!
//! Sources are first-class rows. Every id in an entity's
//! `mentioned_in_sources` must name a registered source, which is checked at
//! every commit boundary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Store-assigned source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(u64);

impl SourceId {
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

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Store-assigned id.
    pub id: SourceId,

    /// Human-readable title.
    pub title: String,

    /// Organisation the interview was held with.
    #[serde(default)]
    pub company: Option<String>,

    /// Who was interviewed.
    #[serde(default)]
    pub respondent: Option<String>,

    /// When the interview happened.
    #[serde(default)]
    pub interviewed_at: Option<DateTime<Utc>>,

    /// When the source was registered.
    pub registered_at: DateTime<Utc>,
}

/// Builder for a source that has not been registered yet.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::NewSource;
///
/// let source = NewSource::new("Interview 7 - finance lead").company("Acme");
/// assert_eq!(source.company.as_deref(), Some("Acme"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSource {
    /// Human-readable title. Must not be blank.
    pub title: String,
    /// Organisation the interview was held with.
    pub company: Option<String>,
    /// Who was interviewed.
    pub respondent: Option<String>,
    /// When the interview happened.
    pub interviewed_at: Option<DateTime<Utc>>,
}

impl NewSource {
    /// A source with only a title.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Sets the company.
    #[must_use]
    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    /// Sets the respondent.
    #[must_use]
    pub fn respondent(mut self, respondent: impl Into<String>) -> Self {
        self.respondent = Some(respondent.into());
        self
    }

    /// Sets the interview time.
    #[must_use]
    pub fn interviewed_at(mut self, at: DateTime<Utc>) -> Self {
        self.interviewed_at = Some(at);
        self
    }

    /// Validates and assigns the id.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptySourceTitle` for a blank title.
    pub fn into_source(self, id: SourceId, registered_at: DateTime<Utc>) -> Result<Source, ValidationError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ValidationError::EmptySourceTitle);
        }
        Ok(Source {
            id,
            title: title.to_string(),
            company: self.company.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            respondent: self.respondent,
            interviewed_at: self.interviewed_at,
            registered_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_source_trims_and_validates() {
        let source = NewSource::new("  Interview 1 ")
            .company("  ")
            .into_source(SourceId::new(1), Utc::now())
            .unwrap();
        assert_eq!(source.title, "Interview 1");
        assert_eq!(source.company, None);

        let err = NewSource::new(" ").into_source(SourceId::new(2), Utc::now());
        assert!(matches!(err, Err(ValidationError::EmptySourceTitle)));
    }
}
