//! Identity resolution for content records.
//!
//! Producers disagree on where a record's key lives (`id`, `docId`,
//! `firebaseId`, `__id`) and on its type (`5` vs `"5"`). Lookups walk an
//! explicit priority list of key fields and compare normalized values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Known key fields, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyField {
    /// Canonical remote key
    Canonical,
    /// Secondary remote key
    Secondary,
    /// Legacy key from older producers
    Legacy,
    /// Numeric surrogate key
    Surrogate,
}

impl KeyField {
    pub const PRIORITY: [KeyField; 4] = [
        KeyField::Canonical,
        KeyField::Secondary,
        KeyField::Legacy,
        KeyField::Surrogate,
    ];

    pub fn field_name(self) -> &'static str {
        match self {
            KeyField::Canonical => "id",
            KeyField::Secondary => "docId",
            KeyField::Legacy => "firebaseId",
            KeyField::Surrogate => "__id",
        }
    }

    /// Read this key from a field map.
    pub fn extract(self, fields: &Map<String, Value>) -> Option<Identity> {
        fields.get(self.field_name()).and_then(Identity::from_value)
    }
}

/// How two identities are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Same type and same value
    Strict,
    /// String-normalized equality (`5` matches `"5"`)
    Coerced,
}

/// A resolved record identity.
///
/// Equality and hashing go through [`Identity::normalized`], so numeric and
/// string spellings of the same key are the same identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Number(i64),
    Text(String),
}

impl Identity {
    /// Interpret a JSON value as an identity. Null, empty strings, booleans,
    /// non-integral numbers and containers are not identities.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Identity::Number(i))
                } else if let Some(u) = n.as_u64() {
                    Some(Identity::Text(u.to_string()))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.is_finite())
                        .map(|f| Identity::Number(f as i64))
                }
            }
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Identity::Text(trimmed.to_string()))
                }
            }
            _ => None,
        }
    }

    pub fn normalized(&self) -> String {
        match self {
            Identity::Number(n) => n.to_string(),
            Identity::Text(s) => s.trim().to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Identity::Number(n) => Value::from(*n),
            Identity::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn matches(&self, other: &Identity, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Strict => match (self, other) {
                (Identity::Number(a), Identity::Number(b)) => a == b,
                (Identity::Text(a), Identity::Text(b)) => a == b,
                _ => false,
            },
            MatchMode::Coerced => self.normalized() == other.normalized(),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other, MatchMode::Coerced)
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.normalized())
    }
}

impl From<i64> for Identity {
    fn from(n: i64) -> Self {
        Identity::Number(n)
    }
}

impl From<i32> for Identity {
    fn from(n: i32) -> Self {
        Identity::Number(n as i64)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity::Text(s.trim().to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity::from(s.as_str())
    }
}

impl From<&Identity> for Identity {
    fn from(id: &Identity) -> Self {
        id.clone()
    }
}

/// Resolve a record's identity: the first key field, in priority order, that
/// holds a usable value.
pub fn resolve_identity(fields: &Map<String, Value>) -> Option<Identity> {
    KeyField::PRIORITY
        .iter()
        .find_map(|key| key.extract(fields))
}

/// Whether any key field of `fields` holds `target` under `mode`.
pub fn fields_match(fields: &Map<String, Value>, target: &Identity, mode: MatchMode) -> bool {
    KeyField::PRIORITY
        .iter()
        .filter_map(|key| key.extract(fields))
        .any(|candidate| candidate.matches(target, mode))
}
