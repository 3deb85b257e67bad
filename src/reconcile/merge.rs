//! Remote notification merge rules.
//!
//! The channel delivers at least once and in no particular order, so each
//! rule is written to tolerate duplicates and early arrivals:
//! - `created` is idempotent (existing identity or temp key wins)
//! - `updated` for an unknown record is dropped
//! - `deleted` for an unknown record is a no-op

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::cache::{resolve_identity, Entity, LocalCache, TempKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl FromStr for ChangeAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeAction::Created),
            "updated" => Ok(ChangeAction::Updated),
            "deleted" => Ok(ChangeAction::Deleted),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Created => write!(f, "created"),
            ChangeAction::Updated => write!(f, "updated"),
            ChangeAction::Deleted => write!(f, "deleted"),
        }
    }
}

/// A parsed change notification for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity_type: String,
    pub action: ChangeAction,
    pub payload: Map<String, Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(entity_type: impl Into<String>, action: ChangeAction, payload: Map<String, Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            action,
            payload,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// What a notification did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New record appended
    Appended,
    /// Record already present (duplicate delivery or own create echoed back)
    DuplicateIgnored,
    /// Fields merged; `protected` lists fields kept because an unconfirmed
    /// local write is newer
    Merged { protected: Vec<String> },
    /// Update for a record not in the cache
    UnknownTarget,
    /// Number of records removed (zero for an unknown identity)
    Removed(usize),
    /// Payload carried no identity
    MissingIdentity,
}

impl MergeOutcome {
    /// Whether the cache changed.
    pub fn changed(&self) -> bool {
        match self {
            MergeOutcome::Appended | MergeOutcome::Merged { .. } => true,
            MergeOutcome::Removed(n) => *n > 0,
            _ => false,
        }
    }
}

/// Apply one notification to the cache.
///
/// `guarded` maps field names to the dispatch time of the newest in-flight
/// local write touching them on the notified record (see
/// [`MutationLedger::guarded_fields`](super::mutation::MutationLedger::guarded_fields)).
/// A guarded field is only overwritten by a notification stamped strictly
/// after that write.
pub fn apply_change(
    cache: &mut LocalCache,
    event: &ChangeEvent,
    guarded: &HashMap<String, DateTime<Utc>>,
) -> MergeOutcome {
    let identity = resolve_identity(&event.payload);

    match event.action {
        ChangeAction::Created => {
            // Only producers that echo a client key carry one; our own
            // creates are matched by identity when their confirmation upserts
            let temp_key = TempKey::from_fields(&event.payload);
            if identity.is_none() && temp_key.is_none() {
                return MergeOutcome::MissingIdentity;
            }
            let known_identity = identity
                .as_ref()
                .is_some_and(|id| cache.find_by_identity(id).is_some());
            let known_temp = temp_key
                .as_ref()
                .is_some_and(|key| cache.find_by_temp_key(key).is_some());
            if known_identity || known_temp {
                return MergeOutcome::DuplicateIgnored;
            }
            if identity.is_none() {
                // Echo of a create we never saw locally and cannot address
                return MergeOutcome::MissingIdentity;
            }
            cache.insert(Entity::from_fields(event.payload.clone()));
            MergeOutcome::Appended
        }
        ChangeAction::Updated => {
            let Some(identity) = identity else {
                return MergeOutcome::MissingIdentity;
            };
            let Some(index) = cache.position(&identity) else {
                return MergeOutcome::UnknownTarget;
            };

            let mut patch = Map::new();
            let mut protected = Vec::new();
            for (key, value) in &event.payload {
                let stale = guarded.get(key).is_some_and(|local_at| match event.timestamp {
                    Some(remote_at) => remote_at <= *local_at,
                    None => true,
                });
                if stale {
                    protected.push(key.clone());
                } else {
                    patch.insert(key.clone(), value.clone());
                }
            }
            protected.sort();
            cache.modify_at(index, |entity| entity.merge(&patch));
            MergeOutcome::Merged { protected }
        }
        ChangeAction::Deleted => match identity {
            Some(identity) => MergeOutcome::Removed(cache.remove(&identity)),
            None => MergeOutcome::MissingIdentity,
        },
    }
}
