// src/cli/mod.rs
// CLI surface: argument parsing plus the worker entry points.

use clap::{Parser, Subcommand};
use memu_sync::clients::{HttpMemoryClient, MetadataStore};
use memu_sync::config::SyncConfig;
use memu_sync::convert::Converter;
use memu_sync::error::{Result, SyncError};
use memu_sync::ingest;
use memu_sync::ingest::docs;
use memu_sync::synclog::SyncLog;
use memu_sync::watch;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "memu-sync")]
#[command(about = "Conversation-to-memory ingestion pipeline for OpenClaw sessions")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch sessions and docs, spawning sync workers on change (default)
    Watch,

    /// Run one sessions sync cycle (convert + ingest)
    Sync,

    /// Run one docs ingest cycle
    Docs {
        /// Restrict ingestion to one changed file or directory
        #[arg(long)]
        changed: Option<PathBuf>,
    },

    /// Force-finalize the staged tail, then run a sync cycle
    Flush,

    /// Convert the session log only; print newly finalized part paths
    Convert,
}

fn load_config() -> Result<SyncConfig> {
    let cfg = SyncConfig::from_env();
    let validation = cfg.validate();
    if !validation.is_valid() {
        return Err(SyncError::Config(validation.report()));
    }
    validation.report();
    Ok(cfg)
}

/// Run the long-lived watcher process.
pub async fn run_watch() -> Result<()> {
    let cfg = load_config()?;
    watch::run_watcher(cfg).await
}

/// Run one sessions sync cycle; `force_flush` finalizes the staged tail
/// regardless of the idle window.
pub async fn run_sync(force_flush: bool) -> Result<()> {
    let mut cfg = load_config()?;
    if force_flush {
        cfg.force_flush = true;
    }

    let log = SyncLog::new(Some(&cfg.data_dir));
    let memory = HttpMemoryClient::new(cfg.service.clone());
    let metadata = MetadataStore::new(cfg.metadata_db_path());

    ingest::run_sessions_sync(&cfg, &memory, &metadata, &log).await?;
    Ok(())
}

/// Run one docs ingest cycle. A `--changed` flag overrides the
/// MEMU_CHANGED_PATH environment handoff from the watcher.
pub async fn run_docs(changed: Option<PathBuf>) -> Result<()> {
    let mut cfg = load_config()?;
    if changed.is_some() {
        cfg.changed_path = changed;
    }

    let log = SyncLog::new(Some(&cfg.data_dir));
    let memory = HttpMemoryClient::new(cfg.service.clone());
    let metadata = MetadataStore::new(cfg.metadata_db_path());

    docs::run_docs_ingest(&cfg, &memory, &metadata, &log).await?;
    Ok(())
}

/// Conversion only; prints the parts finalized by this pass.
pub fn run_convert() -> Result<()> {
    let cfg = load_config()?;
    let parts = Converter::new(&cfg).convert(None)?;

    println!(
        "Converted {} new parts into {}.",
        parts.len(),
        cfg.conversations_dir().display()
    );
    for path in &parts {
        println!("- {}", path.display());
    }
    Ok(())
}
