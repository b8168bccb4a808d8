//! Switchyard server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                      SWITCHYARD                      │
//!                 │                                                      │
//!  Client ────────┼─▶ net::listener ─▶ net::dispatcher ─▶ http::handler  │
//!                 │      (accept)       (registry,         (TLS + SNI)   │
//!                 │                      spawn)                 │        │
//!                 │                                             ▼        │
//!                 │                                   http::connection   │
//!                 │                                  (protocol select)   │
//!                 │                                             │        │
//!                 │                                             ▼        │
//!                 │                                 http::hyper_processor│
//!                 │                                                      │
//!                 │  Cross-cutting: config (+ watcher), tls::watcher,    │
//!                 │  lifecycle (heartbeat, signals), observability       │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use switchyard::config::{load_config, ConfigWatcher, ServerConfig};
use switchyard::http::ConnectionInfoApplication;
use switchyard::lifecycle::{SignalEvent, Signals};
use switchyard::observability::{logging, metrics};
use switchyard::Server;

#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about = "Multi-endpoint HTTP server front end")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on; may be repeated. Added to the configured urls.
    #[arg(long = "urls", value_name = "URL")]
    urls: Vec<String>,

    /// Prefer the urls over configured endpoints.
    #[arg(long)]
    prefer_urls: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    apply_cli(&mut config, &cli);

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut builder = Server::builder(config.clone()).application(Arc::new(ConnectionInfoApplication));
    let _config_watcher = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let cli_urls = cli.urls.clone();
            let prefer = cli.prefer_urls;
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::spawn(forward_with_cli(updates, tx, cli_urls, prefer));
            builder = builder.config_updates(rx);
            Some(watcher.run()?)
        }
        None => None,
    };

    let server = builder.build();
    server.start().await?;

    let mut signals = Signals::install()?;
    loop {
        match signals.recv().await {
            SignalEvent::Shutdown => break,
            SignalEvent::Reload => {
                let Some(path) = &cli.config else {
                    tracing::info!("No configuration file, nothing to reload");
                    continue;
                };
                match load_config(path) {
                    Ok(mut next) => {
                        apply_cli(&mut next, &cli);
                        if let Err(e) = server.reload(next).await {
                            tracing::error!(error = %e, "Reload failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to load configuration, keeping current one"),
                }
            }
        }
    }

    let drained = server.stop(config.server.shutdown_timeout()).await?;
    tracing::info!(drained, "Shutdown complete");
    Ok(())
}

fn apply_cli(config: &mut ServerConfig, cli: &Cli) {
    config.server.urls.extend(cli.urls.iter().cloned());
    if cli.prefer_urls {
        config.server.prefer_host_urls = true;
    }
}

/// Re-apply command line overrides to configurations coming from the file watcher.
async fn forward_with_cli(
    mut updates: tokio::sync::mpsc::UnboundedReceiver<ServerConfig>,
    tx: tokio::sync::mpsc::UnboundedSender<ServerConfig>,
    urls: Vec<String>,
    prefer_urls: bool,
) {
    while let Some(mut config) = updates.recv().await {
        config.server.urls.extend(urls.iter().cloned());
        config.server.prefer_host_urls |= prefer_urls;
        if tx.send(config).is_err() {
            break;
        }
    }
}
