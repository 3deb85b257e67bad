use serde_json::{Map, Value};
use url::Url;

use crate::cache::Identity;
use crate::errors::ApiError;

/// URL layout of the CRUD surface for content resources.
///
/// Reads go to the public `/api/<resource>` route, writes to the admin
/// routes under `/api/admin/<resource>`.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    pub fn new(base: &str) -> Result<Self, ApiError> {
        let mut base = Url::parse(base).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!("{} cannot be a base URL", base)));
        }
        // Drop trailing slashes so joined segments never double up
        let trimmed = base.path().trim_end_matches('/').to_string();
        base.set_path(&trimmed);
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `GET /api/<resource>`
    pub fn list_url(&self, resource: &str) -> Result<Url, ApiError> {
        self.join(&["api", resource])
    }

    /// `POST /api/admin/<resource>`
    pub fn create_url(&self, resource: &str) -> Result<Url, ApiError> {
        self.join(&["api", "admin", resource])
    }

    /// `PUT|DELETE /api/admin/<resource>/<id>`
    pub fn item_url(&self, resource: &str, id: &Identity) -> Result<Url, ApiError> {
        let id = id.normalized();
        self.join(&["api", "admin", resource, &id])
    }

    fn join(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

/// Unwrap a `{ "data": ... }` envelope when the payload is not itself a
/// record.
pub fn unwrap_record(value: Value) -> Value {
    match value {
        Value::Object(mut map) if is_envelope(&map) => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Extract the record list from a list response: a bare array or an array
/// under `data` or `items`.
pub fn unwrap_list(value: Value) -> Result<Vec<Value>, ApiError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ["data", "items"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            Err(ApiError::Parse(
                "list response is neither an array nor an envelope".to_string(),
            ))
        }
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::Parse(format!(
            "unexpected list response type: {}",
            json_type(&other)
        ))),
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    matches!(map.get("data"), Some(Value::Object(_)))
        && crate::cache::resolve_identity(map).is_none()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
