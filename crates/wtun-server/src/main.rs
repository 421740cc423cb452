//! wtun-server: tunnel server.
//!
//! Accepts one authenticated tunnel agent at a time over TLS and exposes a
//! loopback proxy port whose connections are multiplexed through it.

mod config;
mod listener;
mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{Overrides, ServerConfig};
use server::TunnelServer;
use std::path::PathBuf;
use tracing::{error, info};
use wtun_core::tls::{self, TlsMaterial};
use wtun_core::token;

/// Common name of the generated server certificate.
const SERVER_CERT_NAME: &str = "TunnelServer";

/// wtun-server: TCP tunnel server
#[derive(Parser, Debug)]
#[command(name = "wtun-server", version, about = "TCP tunnel server")]
struct Cli {
    /// Tunnel listen port
    #[arg(long = "tunnel-port", visible_alias = "tp")]
    tunnel_port: Option<u16>,

    /// Local proxy listen port (0 picks a free port)
    #[arg(long = "proxy-port", visible_alias = "pp")]
    proxy_port: Option<u16>,

    /// Hex SHA-256 of the client key
    #[arg(long = "key-hash", visible_alias = "kh")]
    key_hash: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Require a TLS client certificate
    #[arg(long)]
    require_client_cert: Option<bool>,

    /// Seconds allowed for TLS and the upgrade handshake
    #[arg(long)]
    handshake_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.wtun/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a random secret key and its SHA-256 hash
    GenKey {
        /// Key length in bytes
        #[arg(long = "key-length", visible_alias = "l", default_value_t = 40)]
        key_length: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Command::GenKey { key_length }) = cli.command {
        if let Err(e) = gen_key(key_length) {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wtun-server");

    let server = match build_server(cli) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("wtun-server stopped");
}

fn build_server(cli: Cli) -> anyhow::Result<TunnelServer> {
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(
        Some(&config_path),
        Overrides {
            tunnel_port: cli.tunnel_port,
            proxy_port: cli.proxy_port,
            key_hash: cli.key_hash,
            cert: cli.cert,
            key: cli.key,
            require_client_cert: cli.require_client_cert,
            handshake_timeout_secs: cli.handshake_timeout,
        },
    )?;
    info!(
        tunnel_port = config.tunnel_port,
        proxy_port = config.proxy_port,
        key_hash = %config.key_hash,
        "configuration loaded"
    );

    let material = TlsMaterial::load_or_generate(
        config.cert_path.as_deref(),
        config.key_path.as_deref(),
        SERVER_CERT_NAME,
    )
    .context("failed to load TLS material")?;
    let tls_config = tls::server_config(&material, config.require_client_cert)
        .context("failed to build TLS config")?;

    Ok(TunnelServer::new(config, tls_config))
}

/// Print a fresh key and the hash the server is configured with.
fn gen_key(key_length: usize) -> anyhow::Result<()> {
    let key = token::generate_key(key_length)?;
    let hash = token::hash_key(&key)?;
    println!("Key: {key}");
    println!("KeyHash: {hash}");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
