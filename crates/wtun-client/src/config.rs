//! Client configuration at `~/.wtun/client.toml`.
//!
//! CLI flags always override config file values.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    /// Tunnel server, `host:port`.
    pub tunnel_endpoint: Option<String>,

    /// Where connections opened by the server are dialed, `host:port`.
    pub target_endpoint: Option<String>,

    /// Hex-encoded client key.
    pub key: Option<String>,

    /// HTTP proxy used to reach the tunnel server, `host:port`.
    pub outgoing_proxy: Option<String>,
    pub outgoing_proxy_username: Option<String>,
    pub outgoing_proxy_password: Option<String>,

    /// Client certificate and key (PEM). Generated when absent.
    pub cert: Option<String>,
    pub key_file: Option<String>,

    /// TLS server name sent to the tunnel server.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            tunnel_endpoint: None,
            target_endpoint: None,
            key: None,
            outgoing_proxy: None,
            outgoing_proxy_username: None,
            outgoing_proxy_password: None,
            cert: None,
            key_file: None,
            server_name: default_server_name(),
            handshake_timeout_secs: default_handshake_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

fn default_server_name() -> String {
    "TunnelServer".to_string()
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_reconnect_attempts() -> u32 {
    9
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_dial_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tunnel_endpoint: Option<String>,
    pub target_endpoint: Option<String>,
    pub key: Option<String>,
    pub outgoing_proxy: Option<String>,
    pub outgoing_proxy_username: Option<String>,
    pub outgoing_proxy_password: Option<String>,
    pub cert: Option<String>,
    pub key_file: Option<String>,
}

/// Resolved client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tunnel_endpoint: String,
    pub target_endpoint: String,
    pub key: String,
    pub outgoing_proxy: Option<String>,
    pub proxy_credentials: Option<(String, String)>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
}

impl ClientConfig {
    /// Merge CLI overrides into the file configuration.
    pub fn resolve(file: Config, cli: Overrides) -> Result<Self> {
        let file = file.client;

        let Some(tunnel_endpoint) = cli.tunnel_endpoint.or(file.tunnel_endpoint) else {
            bail!("tunnel endpoint is required (--tunnel-endpoint or client.tunnel_endpoint)");
        };
        let Some(target_endpoint) = cli.target_endpoint.or(file.target_endpoint) else {
            bail!("target endpoint is required (--target-endpoint or client.target_endpoint)");
        };
        let Some(key) = cli.key.or(file.key) else {
            bail!("client key is required (--key or client.key)");
        };
        split_host_port(&tunnel_endpoint)
            .with_context(|| format!("invalid tunnel endpoint {tunnel_endpoint:?}"))?;
        wtun_core::token::hash_key(&key).context("client key must be hex")?;

        let username = cli.outgoing_proxy_username.or(file.outgoing_proxy_username);
        let password = cli.outgoing_proxy_password.or(file.outgoing_proxy_password);
        let proxy_credentials = match (username, password) {
            (Some(user), pass) if !user.is_empty() => Some((user, pass.unwrap_or_default())),
            _ => None,
        };

        if file.reconnect_attempts == 0 {
            bail!("reconnect_attempts must be at least 1");
        }

        Ok(Self {
            tunnel_endpoint,
            target_endpoint,
            key: key.trim().to_string(),
            outgoing_proxy: cli.outgoing_proxy.or(file.outgoing_proxy),
            proxy_credentials,
            cert_path: cli.cert.or(file.cert).map(|s| expand_tilde(&s)),
            key_path: cli.key_file.or(file.key_file).map(|s| expand_tilde(&s)),
            server_name: file.server_name,
            handshake_timeout: Duration::from_secs(file.handshake_timeout_secs),
            reconnect_attempts: file.reconnect_attempts,
            reconnect_delay: Duration::from_secs(file.reconnect_delay_secs),
            dial_timeout: Duration::from_secs(file.dial_timeout_secs),
        })
    }

    /// Host part of the tunnel endpoint, sent as the `Host` header.
    pub fn tunnel_host(&self) -> &str {
        split_host_port(&self.tunnel_endpoint)
            .map(|(host, _)| host)
            .unwrap_or(self.tunnel_endpoint.as_str())
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("missing port in {endpoint:?}"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        bail!("empty host in {endpoint:?}");
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {endpoint:?}"))?;
    Ok((host, port))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
