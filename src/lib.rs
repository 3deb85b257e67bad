//! Content Sync - admin content synchronizer
//!
//! Keeps an in-memory mirror of a remote content collection in step with
//! the server while an operator edits it:
//!
//! - **Cache**: ordered entity snapshots with multi-key identity resolution
//! - **Reconcile**: optimistic create/update/delete with explicit rollback,
//!   notification merge and a debounced backstop refetch
//! - **Channel**: supervised push channel with exponential reconnect
//!
//! # Quick Start
//!
//! ```ignore
//! use content_sync::{Config, ContentSync, ResourceSpec};
//!
//! let config = Config::load(None)?;
//! let sync = ContentSync::start(&config, ResourceSpec::infer("posts")).await?;
//! let post = sync.reconciler().create(fields).await?;
//! sync.shutdown().await;
//! ```

// ─── Core modules ─────────────────────────────────────────────────
pub mod api;
pub mod cache;
pub mod channel;
pub mod config;
pub mod errors;
pub mod reconcile;
pub mod sync;

// ─── Surfaces & Ambient ──────────────────────────────────────────
pub mod cli;
pub mod observability;

pub use cache::{Entity, Identity, LocalCache};
pub use config::Config;
pub use errors::{ApiError, ChannelError, SyncError};
pub use reconcile::{ChangeEvent, Reconciler};
pub use sync::{ContentSync, ResourceSpec};
