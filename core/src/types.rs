//! Shared primitive types used across the entire engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The canonical run identifier: `run_YYYYmmdd_HHMMSS` (UTC).
pub type RunId = String;

/// A stable, unique identifier for one record in the backing store.
pub type RecordId = String;

/// Whoever is responsible for a record (for claims: the care structure).
pub type ActorId = String;

/// Finding severity. Declaration order is the ordering: low < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low      => "low",
            Severity::Medium   => "medium",
            Severity::High     => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low"      => Some(Severity::Low),
            "medium"   => Some(Severity::Medium),
            "high"     => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// The next severity up, or None for critical.
    pub fn next(&self) -> Option<Self> {
        match self {
            Severity::Low      => Some(Severity::Medium),
            Severity::Medium   => Some(Severity::High),
            Severity::High     => Some(Severity::Critical),
            Severity::Critical => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attribute value on a record. Mirrors the SQLite storage classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v)    => Some(*v),
            FieldValue::Text(s)    => s.trim().parse().ok(),
            FieldValue::Null       => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual form, used for grouping keys and explanations.
    /// Null renders as None so callers can skip missing keys.
    pub fn key_string(&self) -> Option<String> {
        match self {
            FieldValue::Null       => None,
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Real(v)    => Some(v.to_string()),
            FieldValue::Text(s) if s.is_empty() => None,
            FieldValue::Text(s)    => Some(s.clone()),
        }
    }
}

/// Report form: null is the empty string.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null       => Ok(()),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Real(v)    => write!(f, "{v}"),
            FieldValue::Text(s)    => f.write_str(s),
        }
    }
}

impl From<rusqlite::types::Value> for FieldValue {
    fn from(value: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value;
        match value {
            Value::Null       => FieldValue::Null,
            Value::Integer(v) => FieldValue::Integer(v),
            Value::Real(v)    => FieldValue::Real(v),
            Value::Text(s)    => FieldValue::Text(s),
            Value::Blob(b)    => FieldValue::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Integer)
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Real)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Text)
    }
}
