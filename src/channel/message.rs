//! Notification frame parsing and routing.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use tracing::{debug, warn};

use crate::errors::ChannelError;
use crate::observability::telemetry::sanitize_for_log;
use crate::reconcile::{ChangeAction, ChangeEvent};

/// Recent frame fingerprints kept for duplicate suppression.
const DEDUPE_WINDOW: usize = 512;

/// Longest frame excerpt written to the log.
const LOG_EXCERPT: usize = 160;

/// Wire shape: `{"type": "<entity>_<action>", "data": {...}, "timestamp": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

/// Where a parsed message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Change(ChangeEvent),
    /// `ping`, `pong`, `connected` and other non-change messages
    Control(String),
    /// A change for some other entity type
    OtherScope(String),
}

impl ChannelMessage {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let message: ChannelMessage =
            serde_json::from_str(text).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        if message.kind.is_empty() {
            return Err(ChannelError::Malformed("empty message type".to_string()));
        }
        Ok(message)
    }

    /// Milliseconds since the epoch or an RFC 3339 string.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.timestamp.as_ref()? {
            Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Split `<entity>_<action>` on the last underscore.
    pub fn split_kind(&self) -> Option<(&str, ChangeAction)> {
        let (entity, action) = self.kind.rsplit_once('_')?;
        let action = action.parse().ok()?;
        (!entity.is_empty()).then_some((entity, action))
    }

    /// Route this message for a supervisor watching `scope`.
    pub fn route(self, scope: &str) -> Result<Routed, ChannelError> {
        let Some((entity, action)) = self.split_kind() else {
            return Ok(Routed::Control(self.kind));
        };
        if entity != scope {
            return Ok(Routed::OtherScope(entity.to_string()));
        }
        let entity = entity.to_string();
        let timestamp = self.parsed_timestamp();
        let Value::Object(payload) = self.data else {
            return Err(ChannelError::Malformed(format!(
                "{} payload is not an object",
                self.kind
            )));
        };
        let mut event = ChangeEvent::new(entity, action, payload);
        event.timestamp = timestamp;
        Ok(Routed::Change(event))
    }
}

/// Liveness probe sent right after connecting.
pub fn liveness_probe() -> String {
    json!({
        "type": "ping",
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string()
}

/// Turns raw text frames into change events for one scope, dropping
/// malformed and repeated frames.
pub struct FrameRouter {
    scope: String,
    seen: LruCache<String, ()>,
}

impl FrameRouter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            seen: LruCache::new(NonZeroUsize::new(DEDUPE_WINDOW).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn route(&mut self, text: &str) -> Option<ChangeEvent> {
        let message = match ChannelMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(scope = %self.scope, error = %e, frame = %excerpt(text), "Dropping malformed notification");
                return None;
            }
        };

        // Untimestamped frames can legitimately repeat (same edit twice)
        if message.timestamp.is_some() && self.seen.put(fingerprint(text), ()).is_some() {
            debug!(scope = %self.scope, kind = %message.kind, "Duplicate frame suppressed");
            return None;
        }

        match message.route(&self.scope) {
            Ok(Routed::Change(event)) => Some(event),
            Ok(Routed::Control(kind)) => {
                debug!(scope = %self.scope, kind = %sanitize_for_log(&kind), "Control message ignored");
                None
            }
            Ok(Routed::OtherScope(entity)) => {
                debug!(scope = %self.scope, entity = %sanitize_for_log(&entity), "Notification for another entity type");
                None
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, frame = %excerpt(text), "Dropping malformed notification");
                None
            }
        }
    }
}

fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn excerpt(text: &str) -> String {
    let cut: String = text.chars().take(LOG_EXCERPT).collect();
    sanitize_for_log(&cut)
}
