//! Sync engine
//!
//! Wires one [`Reconciler`] to one [`ChannelSupervisor`]: the supervisor's
//! change events are pumped into the reconciler for as long as the engine
//! runs.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::api::{ContentApi, HttpContentApi};
use crate::channel::{
    ChannelState, ChannelSupervisor, ChannelTransport, ReconnectPolicy, SupervisorHandle,
    WebSocketTransport,
};
use crate::config::Config;
use crate::errors::Result;
use crate::reconcile::{Reconciler, ReconcilerOptions};

/// Buffered change events between supervisor and reconciler.
const EVENT_BUFFER: usize = 256;

/// A managed collection and the entity type its notifications use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Path segment of the CRUD endpoints, e.g. `blog-posts`
    pub resource: String,
    /// Prefix of notification types, e.g. `blog_post`
    pub entity_type: String,
}

impl ResourceSpec {
    pub fn new(resource: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            entity_type: entity_type.into(),
        }
    }

    /// Derive the entity type from the resource name: singular, with
    /// dashes turned into underscores.
    pub fn infer(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let entity_type = singularize(&resource).replace('-', "_");
        Self {
            resource,
            entity_type,
        }
    }
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("ss") {
        word.to_string()
    } else if let Some(stem) = word.strip_suffix('s') {
        stem.to_string()
    } else {
        word.to_string()
    }
}

/// Everything the engine needs besides the resource. Swappable for tests.
pub struct SyncParts {
    pub api: Arc<dyn ContentApi>,
    pub transport: Arc<dyn ChannelTransport>,
    pub channel_url: Url,
    pub options: ReconcilerOptions,
    pub policy: ReconnectPolicy,
}

impl SyncParts {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            api: Arc::new(HttpContentApi::new(config)?),
            transport: Arc::new(WebSocketTransport::from_config(config)),
            channel_url: config.channel_url()?,
            options: ReconcilerOptions::from_config(config),
            policy: ReconnectPolicy::from_settings(&config.reconnect),
        })
    }
}

/// A running synchronizer for one resource.
pub struct ContentSync {
    spec: ResourceSpec,
    reconciler: Arc<Reconciler>,
    channel: SupervisorHandle,
    pump: JoinHandle<()>,
}

impl ContentSync {
    pub async fn start(config: &Config, spec: ResourceSpec) -> Result<Self> {
        Self::start_with(spec, SyncParts::from_config(config)?).await
    }

    /// Connect the channel, load the collection, then keep both in step.
    pub async fn start_with(spec: ResourceSpec, parts: SyncParts) -> Result<Self> {
        let reconciler = Arc::new(Reconciler::new(
            spec.resource.clone(),
            parts.api,
            parts.options,
        ));

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let channel = ChannelSupervisor::new(
            parts.channel_url,
            spec.entity_type.clone(),
            parts.transport,
            parts.policy,
        )
        .spawn(tx);

        let target = Arc::clone(&reconciler);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                target.apply_notification(&event);
            }
            debug!(resource = %target.resource(), "Notification pump stopped");
        });

        if let Err(e) = reconciler.refresh().await {
            channel.shutdown().await;
            pump.abort();
            reconciler.shutdown();
            return Err(e);
        }

        info!(resource = %spec.resource, entity_type = %spec.entity_type, "Content sync started");
        Ok(Self {
            spec,
            reconciler,
            channel,
            pump,
        })
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn subscribe_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.subscribe()
    }

    /// Close the channel normally, drain the pump and stop the refetch timer.
    pub async fn shutdown(self) -> ChannelState {
        let state = self.channel.shutdown().await;
        // The supervisor owned the only sender, so the pump ends by itself
        if let Err(e) = self.pump.await {
            debug!(error = %e, "Notification pump ended abnormally");
        }
        self.reconciler.shutdown();
        info!(resource = %self.spec.resource, "Content sync stopped");
        state
    }
}
