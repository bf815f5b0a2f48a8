// src/main.rs
// memu-sync - conversation-to-memory ingestion pipeline

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from the data dir only (never from CWD — a hostile working
    // directory could override service credentials).
    if let Ok(data_dir) = std::env::var("MEMU_DATA_DIR") {
        if let Err(e) = dotenvy::from_path(std::path::Path::new(&data_dir).join(".env")) {
            tracing::debug!("no .env loaded: {}", e);
        }
    }

    let cli = Cli::parse();

    let default_level = match &cli.command {
        Some(Commands::Convert) => Level::WARN,
        _ => Level::INFO,
    };
    let level = std::env::var("MEMU_LOG_LEVEL")
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "error" => Some(Level::ERROR),
            "warn" => Some(Level::WARN),
            "info" => Some(Level::INFO),
            "debug" => Some(Level::DEBUG),
            "trace" => Some(Level::TRACE),
            _ => None,
        })
        .unwrap_or(default_level);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Watch) => cli::run_watch().await?,
        Some(Commands::Sync) => cli::run_sync(false).await?,
        Some(Commands::Flush) => cli::run_sync(true).await?,
        Some(Commands::Docs { changed }) => cli::run_docs(changed).await?,
        Some(Commands::Convert) => cli::run_convert()?,
    }

    Ok(())
}
