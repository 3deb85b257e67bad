//! Content Sync command line
//!
//! Thin operator surface over the library: one-shot CRUD commands and a
//! `watch` mode that runs the full engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cache::{CacheSnapshot, Identity};
use crate::config::Config;
use crate::observability::telemetry::{init_tracing, init_tracing_with_filter};
use crate::reconcile::{Reconciler, ReconcilerOptions};
use crate::sync::{ContentSync, ResourceSpec, SyncParts};

#[derive(Parser)]
#[command(name = "content-sync")]
#[command(about = "Keep admin content in step with the server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Debug logging for this crate
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current collection
    #[command(alias = "ls")]
    List { resource: String },

    /// Follow the collection live until Ctrl-C
    Watch {
        resource: String,
        /// Notification entity type (inferred from the resource by default)
        #[arg(long)]
        entity_type: Option<String>,
    },

    /// Create a record from a JSON object
    Create {
        resource: String,
        #[arg(long, value_name = "OBJECT")]
        json: String,
    },

    /// Patch a record with a JSON object
    Update {
        resource: String,
        id: String,
        #[arg(long, value_name = "OBJECT")]
        json: String,
    },

    /// Delete a record
    #[command(alias = "rm")]
    Delete { resource: String, id: String },
}

pub async fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let filter = if cli.verbose {
        "content_sync=debug".to_string()
    } else {
        config.logging.filter.clone()
    };
    init_tracing_with_filter(&filter, cli.json_logs || config.logging.json);

    match cli.command {
        Commands::List { resource } => {
            let reconciler = one_shot(&config, &resource)?;
            reconciler.refresh().await?;
            print_snapshot(&reconciler.snapshot())?;
        }
        Commands::Watch {
            resource,
            entity_type,
        } => watch(&config, resource, entity_type).await?,
        Commands::Create { resource, json } => {
            let reconciler = one_shot(&config, &resource)?;
            let created = reconciler.create(parse_object(&json)?).await?;
            println!("{}", serde_json::to_string_pretty(&created.to_value())?);
        }
        Commands::Update { resource, id, json } => {
            let reconciler = one_shot(&config, &resource)?;
            reconciler.refresh().await?;
            let updated = reconciler
                .update(parse_identity(&id), parse_object(&json)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&updated.to_value())?);
        }
        Commands::Delete { resource, id } => {
            let reconciler = one_shot(&config, &resource)?;
            reconciler.refresh().await?;
            reconciler.delete(parse_identity(&id)).await?;
            println!("Deleted {} {}", resource, id);
        }
    }
    Ok(())
}

/// A reconciler without backstop refetch, for commands that exit right away.
fn one_shot(config: &Config, resource: &str) -> Result<Reconciler> {
    let parts = SyncParts::from_config(config)?;
    let options = ReconcilerOptions {
        refetch_delay: None,
        ..parts.options
    };
    Ok(Reconciler::new(resource, Arc::clone(&parts.api), options))
}

async fn watch(config: &Config, resource: String, entity_type: Option<String>) -> Result<()> {
    let spec = match entity_type {
        Some(entity_type) => ResourceSpec::new(resource, entity_type),
        None => ResourceSpec::infer(resource),
    };
    let sync = ContentSync::start(config, spec).await?;
    let mut snapshots = sync.reconciler().subscribe();
    let mut channel = sync.subscribe_channel();
    print_snapshot(&snapshots.borrow_and_update().clone())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot)?;
            }
            changed = channel.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *channel.borrow_and_update();
                eprintln!("channel: {}", state);
            }
        }
    }

    let state = sync.shutdown().await;
    eprintln!("channel: {}", state);
    Ok(())
}

fn print_snapshot(snapshot: &CacheSnapshot) -> Result<()> {
    let rows: Vec<Value> = snapshot.entries.iter().map(|e| e.to_value()).collect();
    println!(
        "# version {} ({} records)\n{}",
        snapshot.version,
        snapshot.len(),
        serde_json::to_string_pretty(&rows)?
    );
    Ok(())
}

fn parse_object(json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(json).context("--json is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--json must be an object, got {}", other),
    }
}

/// Numeric ids are sent as numbers, everything else as text.
fn parse_identity(raw: &str) -> Identity {
    raw.parse::<i64>()
        .map(Identity::from)
        .unwrap_or_else(|_| Identity::from(raw))
}
