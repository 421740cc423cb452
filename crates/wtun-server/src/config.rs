//! Server configuration: TOML file + CLI overrides.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub tunnel_port: Option<u16>,
    #[serde(default)]
    pub proxy_port: u16,
    pub key_hash: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default = "default_true")]
    pub require_client_cert: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            tunnel_port: None,
            proxy_port: 0,
            key_hash: None,
            cert: None,
            key: None,
            require_client_cert: true,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_handshake_timeout() -> u64 {
    15
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tunnel_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub key_hash: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub require_client_cert: Option<bool>,
    pub handshake_timeout_secs: Option<u64>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tunnel_port: u16,
    pub proxy_port: u16,
    pub key_hash: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub require_client_cert: bool,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: Overrides) -> anyhow::Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content).context("config parse error")?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        let file = file_config.server;

        let Some(tunnel_port) = cli.tunnel_port.or(file.tunnel_port) else {
            bail!("tunnel port is required (--tunnel-port or server.tunnel_port)");
        };
        let Some(key_hash) = cli.key_hash.or(file.key_hash) else {
            bail!("key hash is required (--key-hash or server.key_hash)");
        };
        let key_hash = key_hash.trim().to_ascii_lowercase();
        if key_hash.len() != 64 || !key_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("key hash must be 64 hex characters (SHA-256)");
        }

        Ok(Self {
            tunnel_port,
            proxy_port: cli.proxy_port.unwrap_or(file.proxy_port),
            key_hash,
            cert_path: cli.cert.or(file.cert).map(|s| expand_tilde_str(&s)),
            key_path: cli.key.or(file.key).map(|s| expand_tilde_str(&s)),
            require_client_cert: cli
                .require_client_cert
                .unwrap_or(file.require_client_cert),
            handshake_timeout: Duration::from_secs(
                cli.handshake_timeout_secs
                    .unwrap_or(file.handshake_timeout_secs),
            ),
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
