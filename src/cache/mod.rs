//! Local Cache
//!
//! In-memory ordered mirror of one remote collection. The entry list is an
//! immutable shared snapshot: every mutation builds a new list and swaps it
//! in, so subscribers can detect changes by reference or version alone.

pub mod entity;
pub mod identity;

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

pub use entity::{Entity, TempKey, TEMP_KEY_FIELD};
pub use identity::{resolve_identity, Identity, KeyField, MatchMode};

use identity::fields_match;

/// Point-in-time view of the cache handed to readers.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub version: u64,
    pub entries: Arc<Vec<Entity>>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same entries, ignoring version.
    pub fn same_entries(&self, other: &CacheSnapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries) || self.entries == other.entries
    }
}

/// Outcome of [`LocalCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Merged { index: usize },
    Appended { index: usize },
}

pub struct LocalCache {
    entries: Arc<Vec<Entity>>,
    version: u64,
    tx: watch::Sender<CacheSnapshot>,
}

impl LocalCache {
    pub fn new() -> Self {
        let entries = Arc::new(Vec::new());
        let (tx, _rx) = watch::channel(CacheSnapshot {
            version: 0,
            entries: Arc::clone(&entries),
        });
        Self {
            entries,
            version: 0,
            tx,
        }
    }

    pub fn with_entries(entities: Vec<Entity>) -> Self {
        let mut cache = Self::new();
        cache.replace(entities);
        cache
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn entries(&self) -> &[Entity] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            version: self.version,
            entries: Arc::clone(&self.entries),
        }
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
        self.tx.subscribe()
    }

    pub fn find_by_identity(&self, identity: &Identity) -> Option<&Entity> {
        self.position(identity).map(|i| &self.entries[i])
    }

    pub fn find_by_temp_key(&self, key: &TempKey) -> Option<&Entity> {
        self.entries
            .iter()
            .find(|e| e.temp_key.as_ref() == Some(key))
    }

    /// Index of the first entity matching `identity`: a strict pass over all
    /// key fields first, then a string-coerced pass.
    pub fn position(&self, identity: &Identity) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| fields_match(&e.fields, identity, MatchMode::Strict))
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| fields_match(&e.fields, identity, MatchMode::Coerced))
            })
    }

    /// Identities held by more than one entry.
    pub fn duplicate_identities(&self) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for identity in self.entries.iter().filter_map(Entity::identity) {
            if !seen.insert(identity.clone()) && !duplicates.contains(&identity) {
                duplicates.push(identity);
            }
        }
        duplicates
    }

    // -----------------------------------------------------------------------
    // Mutations (each one publishes a fresh snapshot)
    // -----------------------------------------------------------------------

    pub fn replace(&mut self, entities: Vec<Entity>) {
        self.publish(entities);
    }

    /// Merge `patch` into the entity matching `identity`, or append a new
    /// entity built from `patch`.
    pub fn upsert(&mut self, identity: &Identity, patch: Map<String, Value>) -> Upserted {
        let mut next = self.entries.as_ref().clone();
        let outcome = match self.position(identity) {
            Some(index) => {
                next[index].merge(&patch);
                Upserted::Merged { index }
            }
            None => {
                let mut fields = patch;
                if resolve_identity(&fields).is_none() {
                    fields.insert(
                        KeyField::Canonical.field_name().to_string(),
                        identity.to_value(),
                    );
                }
                next.push(Entity::from_fields(fields));
                Upserted::Appended {
                    index: next.len() - 1,
                }
            }
        };
        self.publish(next);
        outcome
    }

    /// Drop every entity matching `identity`. Returns how many were removed.
    pub fn remove(&mut self, identity: &Identity) -> usize {
        self.take(identity).len()
    }

    /// Like [`remove`](Self::remove), handing back the removed entities with
    /// the positions they held.
    pub fn take(&mut self, identity: &Identity) -> Vec<(usize, Entity)> {
        let mut next = Vec::with_capacity(self.entries.len());
        let mut taken = Vec::new();
        for (index, entity) in self.entries.iter().enumerate() {
            if fields_match(&entity.fields, identity, MatchMode::Coerced) {
                taken.push((index, entity.clone()));
            } else {
                next.push(entity.clone());
            }
        }
        if !taken.is_empty() {
            self.publish(next);
        }
        taken
    }

    /// Put entities back at the positions [`take`](Self::take) reported,
    /// clamped to the current length.
    pub fn reinsert(&mut self, mut rows: Vec<(usize, Entity)>) {
        if rows.is_empty() {
            return;
        }
        rows.sort_by_key(|(index, _)| *index);
        let mut next = self.entries.as_ref().clone();
        for (index, entity) in rows {
            let at = index.min(next.len());
            next.insert(at, entity);
        }
        self.publish(next);
    }

    pub fn insert(&mut self, entity: Entity) {
        let mut next = self.entries.as_ref().clone();
        next.push(entity);
        self.publish(next);
    }

    pub fn remove_by_temp_key(&mut self, key: &TempKey) -> usize {
        let before = self.entries.len();
        let next: Vec<Entity> = self
            .entries
            .iter()
            .filter(|e| e.temp_key.as_ref() != Some(key))
            .cloned()
            .collect();
        let removed = before - next.len();
        if removed > 0 {
            self.publish(next);
        }
        removed
    }

    /// Apply `f` to the entity at `index` and publish the result.
    pub fn modify_at(&mut self, index: usize, f: impl FnOnce(&mut Entity)) -> bool {
        if index >= self.entries.len() {
            return false;
        }
        let mut next = self.entries.as_ref().clone();
        f(&mut next[index]);
        self.publish(next);
        true
    }

    /// Run `f` over every entity, dropping those it returns false for.
    /// Publishes only when something changed.
    pub fn sweep(&mut self, mut f: impl FnMut(&mut Entity) -> bool) -> bool {
        let mut changed = false;
        let mut next = Vec::with_capacity(self.entries.len());
        for entity in self.entries.iter() {
            let mut swept = entity.clone();
            if !f(&mut swept) {
                changed = true;
                continue;
            }
            changed |= swept != *entity;
            next.push(swept);
        }
        if changed {
            self.publish(next);
        }
        changed
    }

    fn publish(&mut self, entries: Vec<Entity>) {
        self.entries = Arc::new(entries);
        self.version += 1;
        self.tx.send_replace(self.snapshot());
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("version", &self.version)
            .field("len", &self.entries.len())
            .finish()
    }
}
