use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::identity::{resolve_identity, Identity};

/// Field carrying a client temporary key when a producer echoes it back.
/// Create requests never send it.
pub const TEMP_KEY_FIELD: &str = "tempKey";

static TEMP_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Key attached to a client-created record until the server assigns its
/// permanent identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempKey(String);

impl TempKey {
    /// Timestamp, process-wide counter and random suffix: never reused
    /// within a process.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = TEMP_KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::rng().random();
        TempKey(format!("tmp-{}-{}-{:08x}", millis, seq, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read a temporary key echoed in a payload.
    pub fn from_fields(fields: &Map<String, Value>) -> Option<Self> {
        fields
            .get(TEMP_KEY_FIELD)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| TempKey(s.to_string()))
    }
}

impl fmt::Display for TempKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of managed content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Entity {
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optimistic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_key: Option<TempKey>,
}

impl Entity {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            optimistic: false,
            temp_key: None,
        }
    }

    /// Build an entity from a JSON object; anything else is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::from_fields(fields)),
            _ => None,
        }
    }

    /// A speculative record for a create that has not been confirmed yet.
    pub fn optimistic_create(fields: Map<String, Value>, temp_key: TempKey) -> Self {
        Self {
            fields,
            optimistic: true,
            temp_key: Some(temp_key),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        resolve_identity(&self.fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Merge `patch` into this entity. Patch values win; fields the patch
    /// does not mention are kept.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Mark the entity confirmed by the server.
    pub fn settle(&mut self) {
        self.optimistic = false;
        self.temp_key = None;
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}
