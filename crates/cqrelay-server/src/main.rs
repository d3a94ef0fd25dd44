//! cqrelay: OneBot WebSocket relay.
//!
//! Accepts connections from a chat framework, dials the OneBot gateway for
//! each one and relays frames both ways, uploading local media referenced by
//! outbound commands so the gateway receives URLs it can fetch.

mod auth;
mod config;
mod relay;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, RelayConfig};
use cqrelay_core::UploadResolver;
use server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cqrelay", version, about = "OneBot media-rewriting WebSocket relay")]
struct Cli {
    /// Config file path (TOML, or legacy flat JSON when ending in .json)
    #[arg(long, default_value = "cqrelay.toml")]
    config: String,

    /// Listen address, e.g. 0.0.0.0:8081
    #[arg(long)]
    listen: Option<String>,

    /// WebSocket path accepted from the framework
    #[arg(long)]
    path: Option<String>,

    /// Upstream gateway WebSocket URL
    #[arg(long)]
    upstream: Option<String>,

    /// Upload endpoint URL
    #[arg(long)]
    upload_endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting cqrelay");

    // wss:// upstreams need a process-wide rustls provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        listen: cli.listen,
        path: cli.path,
        upstream: cli.upstream,
        upload_endpoint: cli.upload_endpoint,
    };
    let config = match RelayConfig::load(Some(config_path.as_path()), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if config.upload_endpoint.is_none() {
        warn!("no upload endpoint configured, local media will be forwarded unchanged");
    }

    let resolver = UploadResolver::new(config.upload_endpoint.clone(), config.upload_timeout);
    let relay = RelayServer::new(config, resolver);

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("cqrelay stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
