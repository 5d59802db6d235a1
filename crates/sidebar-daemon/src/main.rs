//! sidebar-daemon: Headless chat sidebar client.
//!
//! Keeps a live copy of the sidebar state by bootstrapping from the backend
//! and following its patch stream, and writes preference edits back.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sidebar_core::now_millis;
use sidebar_daemon::http::{EVENTS_PATH, PREFERENCES_EVENTS_PATH};
use sidebar_daemon::{Config, Daemon, HttpBackend, PatchStream, PrefsStorage, StreamSource};

/// Housekeeping interval: degraded-page retries, pruning, bootstrap retries.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "sidebar-daemon")]
#[command(about = "Headless chat sidebar sync client")]
struct Args {
    /// API root of the backend
    #[arg(long, env = "SIDEBAR_BASE_URL", default_value = "http://127.0.0.1:3000/api")]
    base_url: String,

    /// Directory holding config.json and the preferences cache
    #[arg(long, env = "SIDEBAR_CONFIG_DIR", default_value = "./sidebar-config")]
    config_dir: PathBuf,

    /// Bootstrap, print a JSON summary and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(long, env = "SIDEBAR_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sidebar_daemon=debug"
    } else {
        "info,sidebar_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client_id = uuid::Uuid::new_v4();
    info!("Starting sidebar-daemon (client {})", client_id);
    info!("Backend: {}", args.base_url);

    let config = Config::load(&args.config_dir)?;
    let backend = Arc::new(
        HttpBackend::new(&args.base_url, config.page_size)
            .with_context(|| format!("Invalid base URL: {}", args.base_url))?,
    );
    let storage = PrefsStorage::new(&args.config_dir);
    let mut daemon = Daemon::new(config.clone(), Arc::clone(&backend), storage);

    if args.once {
        daemon.start().await.context("Initial sync failed")?;
        println!("{}", serde_json::to_string_pretty(&daemon.summary())?);
        return Ok(());
    }

    if let Err(e) = daemon.start().await {
        warn!("Initial sync failed, retrying in background: {:#}", e);
    }

    let (tx, mut rx) = mpsc::channel(256);
    for (source, path) in [
        (StreamSource::Sidebar, EVENTS_PATH),
        (StreamSource::Preferences, PREFERENCES_EVENTS_PATH),
    ] {
        let url = backend.endpoint(path)?;
        let stream = PatchStream::new(
            backend.client().clone(),
            url,
            source,
            config.reconnect.clone(),
        );
        tokio::spawn(stream.run(tx.clone()));
    }
    drop(tx);

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        let persist_delay = daemon.next_persist_delay(now_millis() as u64);

        tokio::select! {
            Some(event) = rx.recv() => {
                daemon.on_stream_event(event).await;
            }

            _ = tokio::time::sleep(persist_delay.unwrap_or_default()), if persist_delay.is_some() => {
                daemon.persist_due(now_millis() as u64).await;
            }

            _ = tick.tick() => {
                daemon.tick(now_millis()).await;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    daemon.shutdown().await;
    info!("Shutting down");
    Ok(())
}
