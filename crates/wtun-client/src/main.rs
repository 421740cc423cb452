//! wtun-client: tunnel agent.
//!
//! Keeps a TLS tunnel open to wtun-server and dials the target endpoint for
//! every connection the server opens through it.

mod client;
mod config;
mod connector;
mod proxy;

use anyhow::Context;
use clap::Parser;
use client::TunnelClient;
use config::{ClientConfig, Config, Overrides};
use connector::{RetryPolicy, TlsDialer};
use proxy::ProxySettings;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{error, info};
use wtun_core::tls::{self, TlsMaterial};

/// Common name of the generated client certificate.
const CLIENT_CERT_NAME: &str = "TunnelClient";

/// wtun-client: TCP tunnel agent
#[derive(Parser, Debug)]
#[command(name = "wtun-client", version, about = "TCP tunnel agent")]
struct Cli {
    /// Tunnel server, host:port
    #[arg(long = "tunnel-endpoint", visible_alias = "tep")]
    tunnel_endpoint: Option<String>,

    /// Target dialed for each opened connection, host:port
    #[arg(long = "target-endpoint", visible_alias = "tgep")]
    target_endpoint: Option<String>,

    /// Hex-encoded client key
    #[arg(long, visible_alias = "k")]
    key: Option<String>,

    /// HTTP proxy used to reach the tunnel server, host:port
    #[arg(long = "outgoing-proxy", visible_alias = "op")]
    outgoing_proxy: Option<String>,

    /// Outgoing proxy user name
    #[arg(long = "outgoing-proxy-username", visible_alias = "opu")]
    outgoing_proxy_username: Option<String>,

    /// Outgoing proxy password
    #[arg(long = "outgoing-proxy-password", visible_alias = "opp")]
    outgoing_proxy_password: Option<String>,

    /// TLS client certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS client private key (PEM)
    #[arg(long = "key-file")]
    key_file: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wtun/client.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wtun-client");

    let client = match build_client(cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start client");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "client stopped");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("wtun-client stopped");
}

fn build_client(cli: Cli) -> anyhow::Result<TunnelClient<TlsDialer>> {
    let file = Config::load(&config::expand_tilde(&cli.config))?;
    let config = ClientConfig::resolve(
        file,
        Overrides {
            tunnel_endpoint: cli.tunnel_endpoint,
            target_endpoint: cli.target_endpoint,
            key: cli.key,
            outgoing_proxy: cli.outgoing_proxy,
            outgoing_proxy_username: cli.outgoing_proxy_username,
            outgoing_proxy_password: cli.outgoing_proxy_password,
            cert: cli.cert,
            key_file: cli.key_file,
        },
    )?;
    info!(
        tunnel = %config.tunnel_endpoint,
        target = %config.target_endpoint,
        proxy = ?config.outgoing_proxy,
        "configuration loaded"
    );

    let material = TlsMaterial::load_or_generate(
        config.cert_path.as_deref(),
        config.key_path.as_deref(),
        CLIENT_CERT_NAME,
    )
    .context("failed to load TLS material")?;
    let tls_config = tls::client_config(&material).context("failed to build TLS config")?;
    let server_name = tls::server_name(&config.server_name)
        .with_context(|| format!("invalid server name {:?}", config.server_name))?;

    let dialer = TlsDialer {
        tunnel_endpoint: config.tunnel_endpoint.clone(),
        host: config.tunnel_host().to_string(),
        token: config.key.clone(),
        proxy: config.outgoing_proxy.clone().map(|endpoint| ProxySettings {
            endpoint,
            credentials: config.proxy_credentials.clone(),
        }),
        connector: TlsConnector::from(Arc::new(tls_config)),
        server_name,
        dial_timeout: config.dial_timeout,
        handshake_timeout: config.handshake_timeout,
    };
    let policy = RetryPolicy {
        attempts: config.reconnect_attempts,
        delay: config.reconnect_delay,
    };

    Ok(TunnelClient::new(
        dialer,
        config.target_endpoint,
        policy,
        config.dial_timeout,
    ))
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
