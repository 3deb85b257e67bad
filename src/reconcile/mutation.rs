//! Per-mutation state machines.
//!
//! Every local create/update/delete gets a ledger entry that moves
//! `Pending -> Confirmed` or `Pending -> RolledBack` exactly once. The entry
//! keeps what it takes to undo its own optimistic change against whatever
//! the cache holds by then, and, for updates, the written fields so
//! notification merges can protect unconfirmed edits.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;

use crate::cache::{Entity, Identity, TempKey};
use crate::errors::SyncError;

/// How many settled mutation outcomes stay queryable.
const SETTLED_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl MutationId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

impl MutationState {
    /// Validate a transition. Only `Pending` may move, and only forward.
    pub fn transition(self, to: MutationState) -> Result<MutationState, SyncError> {
        match (self, to) {
            (MutationState::Pending, MutationState::Confirmed)
            | (MutationState::Pending, MutationState::RolledBack) => Ok(to),
            _ => Err(SyncError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationState::Pending => write!(f, "Pending"),
            MutationState::Confirmed => write!(f, "Confirmed"),
            MutationState::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// What a mutation is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    /// A speculative record that has no server identity yet
    Temp(TempKey),
    Identity(Identity),
}

impl MutationTarget {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MutationTarget::Identity(id) => Some(id),
            MutationTarget::Temp(_) => None,
        }
    }
}

/// How to take one optimistic change back out of the current cache.
///
/// Rollback never reinstates a whole earlier cache: other mutations may
/// have confirmed since this one was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Undo {
    /// Drop the speculative row carrying the mutation's temp key
    Create,
    /// Field values as they were before the write; `None` marks a field the
    /// entity did not have
    Update {
        written: Map<String, Value>,
        prior: HashMap<String, Option<Value>>,
    },
    /// Rows removed by the delete, with their positions
    Delete { removed: Vec<(usize, Entity)> },
}

impl Undo {
    pub fn kind(&self) -> MutationKind {
        match self {
            Undo::Create => MutationKind::Create,
            Undo::Update { .. } => MutationKind::Update,
            Undo::Delete { .. } => MutationKind::Delete,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub id: MutationId,
    pub kind: MutationKind,
    pub target: MutationTarget,
    pub state: MutationState,
    pub dispatched_at: DateTime<Utc>,
    pub undo: Undo,
}

impl MutationRecord {
    /// Whether this is an update of `identity` that wrote `field`.
    fn writes(&self, identity: &Identity, field: &str) -> bool {
        self.target.identity() == Some(identity)
            && matches!(&self.undo, Undo::Update { written, .. } if written.contains_key(field))
    }
}

pub struct MutationLedger {
    next_id: u64,
    in_flight: HashMap<MutationId, MutationRecord>,
    settled: LruCache<MutationId, MutationState>,
    started: u64,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_flight: HashMap::new(),
            settled: LruCache::new(
                NonZeroUsize::new(SETTLED_HISTORY).unwrap_or(NonZeroUsize::MIN),
            ),
            started: 0,
        }
    }

    /// Register a dispatched mutation in state `Pending`.
    pub fn begin(&mut self, target: MutationTarget, undo: Undo) -> MutationId {
        let id = MutationId(self.next_id);
        self.next_id += 1;
        self.started += 1;
        self.in_flight.insert(
            id,
            MutationRecord {
                id,
                kind: undo.kind(),
                target,
                state: MutationState::Pending,
                dispatched_at: Utc::now(),
                undo,
            },
        );
        id
    }

    /// Move a pending mutation to its final state and hand back its record.
    pub fn settle(&mut self, id: MutationId, to: MutationState) -> Result<MutationRecord, SyncError> {
        let mut record = match self.in_flight.remove(&id) {
            Some(record) => record,
            None => {
                let from = self
                    .settled
                    .peek(&id)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(SyncError::InvalidTransition {
                    from,
                    to: to.to_string(),
                });
            }
        };
        record.state = record.state.transition(to)?;
        self.settled.put(id, record.state);
        Ok(record)
    }

    pub fn state(&self, id: MutationId) -> Option<MutationState> {
        self.in_flight
            .get(&id)
            .map(|r| r.state)
            .or_else(|| self.settled.peek(&id).copied())
    }

    pub fn has_pending(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Count of mutations ever begun; lets a refetch detect that a mutation
    /// started while it was in flight.
    pub fn started(&self) -> u64 {
        self.started
    }

    pub fn pending(&self) -> Vec<(MutationId, MutationKind)> {
        let mut pending: Vec<_> = self
            .in_flight
            .values()
            .map(|r| (r.id, r.kind))
            .collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
    }

    /// Latest dispatch time of an in-flight update per field, for the entity
    /// identified by `identity`.
    pub fn guarded_fields(&self, identity: &Identity) -> HashMap<String, DateTime<Utc>> {
        let mut guarded: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in self.in_flight.values() {
            if record.target.identity() != Some(identity) {
                continue;
            }
            let Undo::Update { written, .. } = &record.undo else {
                continue;
            };
            for field in written.keys() {
                let entry = guarded.entry(field.clone()).or_insert(record.dispatched_at);
                if record.dispatched_at > *entry {
                    *entry = record.dispatched_at;
                }
            }
        }
        guarded
    }

    /// Whether an in-flight create still owns the row keyed by `key`.
    pub fn is_creating(&self, key: &TempKey) -> bool {
        self.in_flight
            .values()
            .any(|r| matches!(&r.target, MutationTarget::Temp(k) if k == key))
    }

    /// Whether an in-flight update holds the entity optimistic.
    pub fn is_updating(&self, identity: &Identity) -> bool {
        self.in_flight
            .values()
            .any(|r| r.kind == MutationKind::Update && r.target.identity() == Some(identity))
    }

    /// Hand the pre-write value of `field` to the oldest in-flight update of
    /// `identity` dispatched after `after` that also wrote it. That update's
    /// own rollback then restores the value from before both writes.
    ///
    /// Returns false when no later write exists.
    pub fn inherit_prior(
        &mut self,
        after: MutationId,
        identity: &Identity,
        field: &str,
        before: Option<Value>,
    ) -> bool {
        let next = self
            .in_flight
            .values_mut()
            .filter(|r| r.id > after && r.writes(identity, field))
            .min_by_key(|r| r.id);
        match next {
            Some(record) => {
                if let Undo::Update { prior, .. } = &mut record.undo {
                    prior.insert(field.to_string(), before);
                }
                true
            }
            None => false,
        }
    }
}

impl Default for MutationLedger {
    fn default() -> Self {
        Self::new()
    }
}
