//! frontgate: encrypted-address TCP gateway.
//!
//! Accepts raw binary-framed and WebSocket connections, decrypts the backend
//! address each client presents, and tunnels bytes to that backend.

mod binary;
mod config;
mod logging;
mod resolver;
mod server;
mod tunnel;
mod websocket;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use frontgate_core::CipherMode;
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// frontgate: encrypted-address TCP gateway
#[derive(Parser, Debug)]
#[command(name = "frontgate", version, about = "Encrypted-address TCP gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.frontgate/config.toml")]
    config: String,

    /// Binary protocol listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket listen port
    #[arg(long)]
    websocket_port: Option<u16>,

    /// Address cipher secret
    #[arg(long, env = "FRONTGATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Address cipher mode (chained, ecb)
    #[arg(long)]
    cipher_mode: Option<CipherMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Config first: it decides where the log files go.
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        websocket_port: cli.websocket_port,
        secret: cli.secret,
        cipher_mode: cli.cipher_mode,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("frontgate: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let _log_guards = match logging::init(
        &cli.log_level,
        server_config.info_log.as_deref(),
        server_config.error_log.as_deref(),
    ) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("frontgate: failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        websocket_port = server_config.websocket_port,
        "starting frontgate"
    );
    match &server_config.source {
        Some(path) => info!(path = %path.display(), "loaded config file"),
        None => info!(path = %cli.config, "config file not found, using defaults"),
    }

    let gateway = match GatewayServer::bind(&server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    let shared = gateway.gateway();
    info!(
        cipher_mode = ?shared.resolver.cipher().mode(),
        cache_max_entries = shared.resolver.cache().max_entries(),
        "address resolver ready"
    );

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("frontgate stopped");
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
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
