//! Field values carried by entities.
//!
//! Extraction output is loosely typed JSON. Entity fields keep just enough
//! structure to merge correctly: scalars (text or number) and string lists.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single entity field value.
///
/// Serialized untagged so extraction JSON maps onto it directly:
/// `null`, numbers, strings and arrays of strings.
///
/// # Examples
///
/// ```
/// use kyro_consolidate::FieldValue;
///
/// let severity = FieldValue::from("High");
/// assert_eq!(severity.as_text(), Some("High"));
///
/// let companies = FieldValue::from(vec!["Acme", "Globex"]);
/// assert_eq!(companies.as_list().map(<[String]>::len), Some(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Explicitly absent.
    Null,
    /// A numeric value, compared by its display form.
    Number(f64),
    /// A single string.
    Text(String),
    /// A multi-valued field.
    List(Vec<String>),
}

impl FieldValue {
    /// Returns true for `Null`, blank text and empty lists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Number(_) => false,
            Self::Text(s) => s.trim().is_empty(),
            Self::List(items) => items.iter().all(|s| s.trim().is_empty()),
        }
    }

    /// Returns true for a list.
    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// The string of a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The number of a numeric value.
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The items of a list value.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Case- and whitespace-insensitive key used to compare scalar values.
    ///
    /// Returns `None` for empty values and lists.
    #[must_use]
    pub fn comparison_key(&self) -> Option<String> {
        match self {
            Self::Text(s) if !s.trim().is_empty() => Some(
                s.split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase(),
            ),
            Self::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::List(items) => f.write_str(&items.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(items: Vec<&str>) -> Self {
        Self::List(items.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_json_shapes() {
        let v: FieldValue = serde_json::from_str("null").unwrap();
        assert_eq!(v, FieldValue::Null);
        let v: FieldValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, FieldValue::Number(3.0));
        let v: FieldValue = serde_json::from_str("\"High\"").unwrap();
        assert_eq!(v, FieldValue::Text("High".into()));
        let v: FieldValue = serde_json::from_str("[\"a\",\"b\"]").unwrap();
        assert_eq!(v, FieldValue::from(vec!["a", "b"]));
    }

    #[test]
    fn test_emptiness() {
        assert!(FieldValue::Null.is_empty());
        assert!(FieldValue::from("   ").is_empty());
        assert!(FieldValue::List(vec![]).is_empty());
        assert!(!FieldValue::Number(0.0).is_empty());
        assert!(!FieldValue::from("x").is_empty());
    }

    #[test]
    fn test_comparison_key_ignores_case_and_spacing() {
        let a = FieldValue::from("Very  High");
        let b = FieldValue::from("very high");
        assert_eq!(a.comparison_key(), b.comparison_key());
        assert_eq!(FieldValue::Null.comparison_key(), None);
    }
}
