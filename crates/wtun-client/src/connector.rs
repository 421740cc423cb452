//! Client side of the tunnel session: dialing and reconnecting.
//!
//! A [`Dialer`] produces a ready tunnel (TCP, optional proxy `CONNECT`, TLS,
//! upgrade handshake). [`reconnect`] purges the lost tunnel's connections
//! and then retries the dialer a bounded number of times.

use crate::proxy::{self, ProxySettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};
use wtun_core::{handshake, tunnel};
use wtun_core::{ConnectionRegistry, Role, TunnelError, TunnelReader, TunnelResult, TunnelWriter};

/// Opens a new tunnel to the server.
#[allow(async_fn_in_trait)]
pub trait Dialer {
    async fn dial(&self) -> TunnelResult<(TunnelReader, TunnelWriter)>;
}

/// Dials the tunnel server over TLS, directly or through an HTTP proxy.
pub struct TlsDialer {
    pub tunnel_endpoint: String,
    pub host: String,
    pub token: String,
    pub proxy: Option<ProxySettings>,
    pub connector: TlsConnector,
    pub server_name: rustls::pki_types::ServerName<'static>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl TlsDialer {
    async fn connect_tcp(&self) -> TunnelResult<TcpStream> {
        let stream = match &self.proxy {
            Some(proxy) => proxy::connect_via_proxy(proxy, &self.tunnel_endpoint).await?,
            None => TcpStream::connect(&self.tunnel_endpoint).await?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Dialer for TlsDialer {
    async fn dial(&self) -> TunnelResult<(TunnelReader, TunnelWriter)> {
        let tcp = tokio::time::timeout(self.dial_timeout, self.connect_tcp()).await??;
        info!(endpoint = %self.tunnel_endpoint, "connected to tunnel server");

        // The timeout covers establishment only; the tunnel itself may idle.
        let tls = tokio::time::timeout(self.handshake_timeout, async {
            let mut tls = self
                .connector
                .connect(self.server_name.clone(), tcp)
                .await?;
            handshake::client_handshake(&mut tls, &self.host, &self.token).await?;
            Ok::<_, TunnelError>(tls)
        })
        .await??;

        info!("websocket handshake completed");
        Ok(tunnel::split(tls, Role::Client))
    }
}

/// How often and how patiently to redial.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 9,
            delay: Duration::from_secs(2),
        }
    }
}

/// Purge `lost` and dial again until `policy` is exhausted.
///
/// A registry that was already purged is left alone.
pub async fn reconnect<D: Dialer>(
    dialer: &D,
    lost: &Arc<ConnectionRegistry>,
    policy: RetryPolicy,
) -> TunnelResult<(TunnelReader, TunnelWriter)> {
    if lost.purges() == 0 {
        lost.remove_all().await;
    }

    for attempt in 1..=policy.attempts {
        info!(attempt, "reconnecting to the server");
        match dialer.dial().await {
            Ok(tunnel) => return Ok(tunnel),
            Err(e) => warn!(attempt, error = %e, "can't connect to server"),
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    error!(attempts = policy.attempts, "failed to reconnect to tunnel server");
    Err(TunnelError::Other(format!(
        "gave up reconnecting after {} attempts",
        policy.attempts
    )))
}
