//! Reconciler
//!
//! Applies local mutations optimistically, confirms or rolls them back from
//! the server's answer, and merges remote change notifications into the
//! same cache. A debounced backstop refetch converges whatever slipped
//! through.
//!
//! Cache and ledger locks are taken in that order and never held across an
//! `.await`.

pub mod merge;
pub mod mutation;
pub mod refetch;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{retry_idempotent, ContentApi, RetryConfig};
use crate::cache::{resolve_identity, CacheSnapshot, Entity, Identity, LocalCache, TempKey};
use crate::config::Config;
use crate::errors::{ApiError, Result, SyncError};
use crate::observability::telemetry::track_mutation;

pub use merge::{apply_change, ChangeAction, ChangeEvent, MergeOutcome};
pub use mutation::{MutationId, MutationKind, MutationLedger, MutationState, MutationTarget, Undo};
pub use refetch::RefetchScheduler;

/// Result of an authoritative fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache replaced with this many entities
    Applied(usize),
    /// A local mutation started or is still in flight; result discarded
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub retry: RetryConfig,
    /// Upper bound on a single CRUD call
    pub request_timeout: Option<Duration>,
    /// Backstop refetch delay; `None` disables it
    pub refetch_delay: Option<Duration>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Some(Duration::from_secs(15)),
            refetch_delay: Some(Duration::from_millis(1000)),
        }
    }
}

impl ReconcilerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryConfig::from_settings(&config.retry),
            request_timeout: Some(Duration::from_secs(config.request_timeout_secs)),
            refetch_delay: config.refetch.delay(),
        }
    }
}

/// State shared between the reconciler and its refetch timer.
pub(crate) struct Inner {
    resource: String,
    api: Arc<dyn ContentApi>,
    retry: RetryConfig,
    request_timeout: Option<Duration>,
    cache: Mutex<LocalCache>,
    ledger: Mutex<MutationLedger>,
}

impl Inner {
    async fn call<T>(&self, fut: impl Future<Output = std::result::Result<T, ApiError>>) -> std::result::Result<T, ApiError> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(ApiError::Timeout)),
            None => fut.await,
        }
    }

    /// Fetch the full collection and swap it in, unless a mutation started
    /// meanwhile or is still pending.
    async fn fetch_authoritative(&self) -> Result<RefreshOutcome> {
        let started_before = self.ledger.lock().started();

        let resource = self.resource.as_str();
        let api = &self.api;
        let raw = retry_idempotent(&self.retry, "list", move || self.call(api.list(resource))).await?;

        let mut seen = HashSet::new();
        let mut entities = Vec::with_capacity(raw.len());
        for value in raw {
            let Some(entity) = Entity::from_value(value) else {
                warn!(resource, "Skipping non-object entry in list response");
                continue;
            };
            if let Some(identity) = entity.identity() {
                if !seen.insert(identity.normalized()) {
                    debug!(resource, %identity, "Duplicate identity in list response");
                    continue;
                }
            }
            entities.push(entity);
        }

        let mut cache = self.cache.lock();
        let ledger = self.ledger.lock();
        if ledger.has_pending() || ledger.started() != started_before {
            return Ok(RefreshOutcome::Deferred);
        }
        let count = entities.len();
        cache.replace(entities);
        Ok(RefreshOutcome::Applied(count))
    }

    /// Take back this mutation's own optimistic change. Whatever other
    /// mutations and notifications did to the cache meanwhile stays.
    fn roll_back(&self, mutation: MutationId) {
        let mut cache = self.cache.lock();
        let mut ledger = self.ledger.lock();
        let record = match ledger.settle(mutation, MutationState::RolledBack) {
            Ok(record) => record,
            Err(e) => {
                warn!(resource = %self.resource, %mutation, error = %e, "Rollback skipped");
                return;
            }
        };

        let kind = record.kind;
        match (record.target, record.undo) {
            (MutationTarget::Temp(key), Undo::Create) => {
                cache.remove_by_temp_key(&key);
            }
            (MutationTarget::Identity(target), Undo::Update { written, mut prior }) => {
                let current = cache.position(&target).map(|i| (i, cache.entries()[i].clone()));
                let mut revert = Map::new();
                let mut absent = Vec::new();
                for (field, value) in &written {
                    let before = prior.remove(field).flatten();
                    if ledger.inherit_prior(mutation, &target, field, before.clone()) {
                        continue;
                    }
                    let Some((_, entity)) = &current else { continue };
                    // Overwritten since by a notification or a confirmation
                    if entity.get(field) != Some(value) {
                        continue;
                    }
                    match before {
                        Some(before) => {
                            revert.insert(field.clone(), before);
                        }
                        None => absent.push(field.clone()),
                    }
                }
                if let Some((index, _)) = current {
                    if !revert.is_empty() || !absent.is_empty() {
                        cache.modify_at(index, |entity| {
                            entity.merge(&revert);
                            for field in &absent {
                                entity.fields.remove(field);
                            }
                        });
                    }
                }
            }
            (MutationTarget::Identity(target), Undo::Delete { removed }) => {
                // A `created` notification may have brought it back already
                if cache.position(&target).is_none() {
                    cache.reinsert(removed);
                }
            }
            (target, undo) => {
                warn!(resource = %self.resource, %mutation, ?target, kind = undo.kind().as_str(), "Undo does not fit its target");
            }
        }
        sweep_flags(&mut cache, &ledger);
        debug!(resource = %self.resource, %mutation, kind = kind.as_str(), "Optimistic change rolled back");
    }
}

/// Recompute every entity's optimistic flag from the ledger and drop
/// speculative rows whose create is no longer in flight.
fn sweep_flags(cache: &mut LocalCache, ledger: &MutationLedger) {
    cache.sweep(|entity| {
        if let Some(key) = &entity.temp_key {
            return ledger.is_creating(key);
        }
        entity.optimistic = entity
            .identity()
            .is_some_and(|identity| ledger.is_updating(&identity));
        true
    });
}

/// Optimistic mutation and notification merge for one resource.
pub struct Reconciler {
    inner: Arc<Inner>,
    refetch: RefetchScheduler,
}

impl Reconciler {
    pub fn new(resource: impl Into<String>, api: Arc<dyn ContentApi>, options: ReconcilerOptions) -> Self {
        let inner = Arc::new(Inner {
            resource: resource.into(),
            api,
            retry: options.retry,
            request_timeout: options.request_timeout,
            cache: Mutex::new(LocalCache::new()),
            ledger: Mutex::new(MutationLedger::new()),
        });
        let refetch = RefetchScheduler::new(Arc::clone(&inner), options.refetch_delay);
        Self { inner, refetch }
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Seed the cache without touching the server.
    pub fn load(&self, entities: Vec<Entity>) {
        self.inner.cache.lock().replace(entities);
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.inner.cache.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
        self.inner.cache.lock().subscribe()
    }

    pub fn find(&self, identity: impl Into<Identity>) -> Option<Entity> {
        self.inner.cache.lock().find_by_identity(&identity.into()).cloned()
    }

    pub fn pending_mutations(&self) -> Vec<(MutationId, MutationKind)> {
        self.inner.ledger.lock().pending()
    }

    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.inner.ledger.lock().state(id)
    }

    /// Fetch the authoritative collection now.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let outcome = self.inner.fetch_authoritative().await?;
        match outcome {
            RefreshOutcome::Applied(count) => info!(resource = %self.inner.resource, count, "Collection loaded"),
            RefreshOutcome::Deferred => debug!(resource = %self.inner.resource, "Refresh raced a mutation, discarded"),
        }
        Ok(outcome)
    }

    /// Create a record. The optimistic row appears immediately and is
    /// replaced by the server's version on success.
    pub async fn create(&self, fields: Map<String, Value>) -> Result<Entity> {
        let inner = &self.inner;
        let temp_key = TempKey::generate();
        let mutation = {
            let mut cache = inner.cache.lock();
            cache.insert(Entity::optimistic_create(fields.clone(), temp_key.clone()));
            inner
                .ledger
                .lock()
                .begin(MutationTarget::Temp(temp_key.clone()), Undo::Create)
        };
        debug!(resource = %inner.resource, %mutation, %temp_key, "Optimistic create dispatched");

        let result = track_mutation(&inner.resource, "create", || {
            inner.call(inner.api.create(&inner.resource, &fields))
        })
        .await;

        let outcome = match result {
            Ok(value) => self.confirm_create(mutation, &temp_key, fields, value),
            Err(e) => {
                inner.roll_back(mutation);
                Err(e.into())
            }
        };
        self.refetch.schedule();
        outcome
    }

    fn confirm_create(
        &self,
        mutation: MutationId,
        temp_key: &TempKey,
        sent: Map<String, Value>,
        response: Value,
    ) -> Result<Entity> {
        let mut cache = self.inner.cache.lock();
        let mut ledger = self.inner.ledger.lock();
        ledger.settle(mutation, MutationState::Confirmed)?;

        let server = match response {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        cache.remove_by_temp_key(temp_key);

        let created = match resolve_identity(&server) {
            Some(identity) => {
                // A racing `created` notification may already have appended it
                cache.upsert(&identity, server.clone());
                sweep_flags(&mut cache, &ledger);
                cache
                    .find_by_identity(&identity)
                    .cloned()
                    .unwrap_or_else(|| Entity::from_fields(server))
            }
            None => {
                warn!(resource = %self.inner.resource, %mutation, "Create response carried no identity");
                let mut entity = Entity::from_fields(sent);
                entity.merge(&server);
                cache.insert(entity.clone());
                sweep_flags(&mut cache, &ledger);
                entity
            }
        };
        Ok(created)
    }

    /// Update the record identified by `identity` with `patch`.
    pub async fn update(&self, identity: impl Into<Identity>, patch: Map<String, Value>) -> Result<Entity> {
        let inner = &self.inner;
        let requested = identity.into();
        let (mutation, target) = {
            let mut cache = inner.cache.lock();
            let Some(index) = cache.position(&requested) else {
                return Err(SyncError::IdentityNotFound {
                    identity: requested.to_string(),
                });
            };
            let target = cache.entries()[index]
                .identity()
                .unwrap_or_else(|| requested.clone());
            let prior: HashMap<String, Option<Value>> = {
                let entity = &cache.entries()[index];
                patch
                    .keys()
                    .map(|field| (field.clone(), entity.get(field).cloned()))
                    .collect()
            };
            cache.modify_at(index, |entity| {
                entity.merge(&patch);
                entity.optimistic = true;
            });
            let mutation = inner.ledger.lock().begin(
                MutationTarget::Identity(target.clone()),
                Undo::Update {
                    written: patch.clone(),
                    prior,
                },
            );
            (mutation, target)
        };
        debug!(resource = %inner.resource, %mutation, %target, "Optimistic update dispatched");

        let result = track_mutation(&inner.resource, "update", || {
            inner.call(inner.api.update(&inner.resource, &target, &patch))
        })
        .await;

        let outcome = match result {
            Ok(value) => self.confirm_update(mutation, &target, value),
            Err(e) => {
                inner.roll_back(mutation);
                Err(e.into())
            }
        };
        self.refetch.schedule();
        outcome
    }

    fn confirm_update(&self, mutation: MutationId, target: &Identity, response: Value) -> Result<Entity> {
        let mut cache = self.inner.cache.lock();
        let mut ledger = self.inner.ledger.lock();
        ledger.settle(mutation, MutationState::Confirmed)?;

        let server = match response {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        match cache.position(target) {
            Some(index) => {
                cache.modify_at(index, |entity| entity.merge(&server));
            }
            None => {
                debug!(resource = %self.inner.resource, %target, "Updated record left the cache before confirmation");
            }
        }
        sweep_flags(&mut cache, &ledger);
        Ok(cache
            .find_by_identity(target)
            .cloned()
            .unwrap_or_else(|| Entity::from_fields(server)))
    }

    /// Delete the record identified by `identity`. Retried on transient
    /// failures; a 404 means it is already gone.
    pub async fn delete(&self, identity: impl Into<Identity>) -> Result<()> {
        let inner = &self.inner;
        let requested = identity.into();
        let (mutation, target) = {
            let mut cache = inner.cache.lock();
            let Some(index) = cache.position(&requested) else {
                return Err(SyncError::IdentityNotFound {
                    identity: requested.to_string(),
                });
            };
            let target = cache.entries()[index]
                .identity()
                .unwrap_or_else(|| requested.clone());
            let removed = cache.take(&target);
            let mutation = inner
                .ledger
                .lock()
                .begin(MutationTarget::Identity(target.clone()), Undo::Delete { removed });
            (mutation, target)
        };
        debug!(resource = %inner.resource, %mutation, %target, "Optimistic delete dispatched");

        let result = track_mutation(&inner.resource, "delete", || async {
            let resource = inner.resource.as_str();
            let target = &target;
            let attempt = retry_idempotent(&inner.retry, "delete", move || {
                inner.call(inner.api.delete(resource, target))
            })
            .await;
            match attempt {
                Err(ApiError::HttpStatus { status: 404, .. }) => {
                    debug!(resource, %target, "Delete target already gone");
                    Ok(())
                }
                other => other,
            }
        })
        .await;

        let outcome = match result {
            Ok(()) => {
                let mut cache = inner.cache.lock();
                let mut ledger = inner.ledger.lock();
                ledger.settle(mutation, MutationState::Confirmed)?;
                sweep_flags(&mut cache, &ledger);
                Ok(())
            }
            Err(e) => {
                inner.roll_back(mutation);
                Err(e.into())
            }
        };
        self.refetch.schedule();
        outcome
    }

    /// Merge a remote change notification into the cache.
    pub fn apply_notification(&self, event: &ChangeEvent) -> MergeOutcome {
        let outcome = {
            let mut cache = self.inner.cache.lock();
            let guarded = {
                let ledger = self.inner.ledger.lock();
                resolve_identity(&event.payload)
                    .and_then(|id| cache.find_by_identity(&id).and_then(Entity::identity))
                    .map(|id| ledger.guarded_fields(&id))
                    .unwrap_or_default()
            };
            apply_change(&mut cache, event, &guarded)
        };

        match &outcome {
            MergeOutcome::MissingIdentity => {
                warn!(resource = %self.inner.resource, action = %event.action, "Notification without identity dropped");
                return outcome;
            }
            MergeOutcome::Merged { protected } if !protected.is_empty() => {
                debug!(resource = %self.inner.resource, ?protected, "Kept unconfirmed local fields");
            }
            other => {
                debug!(resource = %self.inner.resource, action = %event.action, outcome = ?other, "Notification merged");
            }
        }
        self.refetch.schedule();
        outcome
    }

    /// Cancel the backstop timer. In-flight CRUD calls finish on their own.
    pub fn shutdown(&self) {
        self.refetch.cancel();
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("resource", &self.inner.resource)
            .field("cache", &*self.inner.cache.lock())
            .finish()
    }
}
