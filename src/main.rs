//! Secure channel server.
//!
//! A demo echo server built around the secure transport boundary.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌───────────────────────────────────────────────┐
//!                       │                SECURE CHANNEL                  │
//!                       │                                                │
//!   Client connection   │  ┌─────────┐   ┌────────────┐   ┌───────────┐  │
//!   ────────────────────┼─▶│   net   │──▶│ negotiator │──▶│connection │  │
//!                       │  │listener │   │ (TLS open) │   │ read/write│  │
//!                       │  └─────────┘   └─────┬──────┘   └─────┬─────┘  │
//!                       │                      │                │        │
//!                       │               ┌──────▼──────┐   ┌─────▼─────┐  │
//!                       │               │ tls manager │   │ wait set  │  │
//!                       │               │  + context  │   │ supervisor│  │
//!                       │               └─────────────┘   │ interrupts│  │
//!                       │                                 └───────────┘  │
//!                       │  config · observability · lifecycle (signals)  │
//!                       └───────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use secure_channel::config::watcher::ConfigWatcher;
use secure_channel::config::TlsConfig;
use secure_channel::lifecycle::signals::{SignalEvent, Signals};
use secure_channel::lifecycle::{startup, supervisor_channel, ConnectionTracker, Shutdown};
use secure_channel::net::listener::Listener;
use secure_channel::observability::{logging, metrics};
use secure_channel::server::{self, ServerContext};
use secure_channel::tls::ChannelManager;

#[derive(Debug, Parser)]
#[command(name = "secure-channel", version, about = "TLS-capable echo server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "secure-channel.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = startup::load_or_default(&cli.config)?;
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "secure-channel starting"
    );

    let manager = Arc::new(ChannelManager::new(config.tls.clone()));
    startup::exit_on_fatal(manager.initialize(true))?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let (supervisor, watch) = supervisor_channel()?;
    let tracker = Arc::new(ConnectionTracker::new());
    let shutdown = Shutdown::new();

    let listener = Listener::bind(&config.listener).await?;
    let context = ServerContext {
        manager: manager.clone(),
        supervisor: watch,
        tracker: tracker.clone(),
    };
    let accept_loop = tokio::spawn(server::run(listener, context, shutdown.subscribe()));

    // Keep the watcher alive for as long as updates are wanted.
    let (_watcher, mut updates) = if config.lifecycle.watch_config {
        let (watcher, rx) = ConfigWatcher::new(&cli.config, &config.tls);
        match watcher.run() {
            Ok(handle) => (Some(handle), Some(rx)),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let mut signals = Signals::install()?;
    loop {
        tokio::select! {
            event = signals.next() => match event {
                SignalEvent::Reload => startup::reload_tls(&cli.config, &manager),
                SignalEvent::Shutdown => break,
            },
            Some(tls) = next_update(&mut updates) => startup::apply_reload(tls, &manager),
        }
    }

    tracing::info!(subscribers = shutdown.receiver_count(), "Shutting down");
    shutdown.trigger();
    if let Err(e) = accept_loop.await {
        tracing::error!(error = %e, "Accept loop panicked");
    }

    tracker.terminate_all();
    let grace = Duration::from_secs(config.lifecycle.shutdown_grace_secs);
    if !tracker.wait_drained(grace).await {
        tracing::warn!(remaining = tracker.len(), "Connections still open after grace period");
    }

    manager.destroy();
    // Anything still parked in a wait sees the supervisor go away.
    drop(supervisor);

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn next_update(updates: &mut Option<mpsc::UnboundedReceiver<TlsConfig>>) -> Option<TlsConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
