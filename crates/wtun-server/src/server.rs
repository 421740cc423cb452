//! Core server: binds both listeners and runs the tunnel dispatch loop.
//!
//! The dispatch loop is the only reader of the tunnel. It routes each
//! envelope to the connection registry of the current tunnel and, on tunnel
//! loss, waits for the accept loop to install a replacement.

use crate::config::ServerConfig;
use crate::listener::{self, EstablishedTunnel, TunnelSlot};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use wtun_core::frame::read_frame;
use wtun_core::registry::spawn_count_reporter;
use wtun_core::{ConnectionRegistry, Message, MessageKind, Role};

/// How often the live connection count is logged.
const COUNT_REPORT_PERIOD: Duration = Duration::from_millis(7500);

/// The wtun server instance.
pub struct TunnelServer {
    config: ServerConfig,
    tls_config: Arc<rustls::ServerConfig>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, tls_config: rustls::ServerConfig) -> Self {
        Self {
            config,
            tls_config: Arc::new(tls_config),
        }
    }

    /// Bind the listeners and serve until the process is stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        let tunnel_listener = TcpListener::bind(("0.0.0.0", self.config.tunnel_port))
            .await
            .with_context(|| format!("cannot bind tunnel port {}", self.config.tunnel_port))?;
        let proxy_listener = TcpListener::bind(("127.0.0.1", self.config.proxy_port))
            .await
            .with_context(|| format!("cannot bind proxy port {}", self.config.proxy_port))?;

        info!(
            tunnel = %tunnel_listener.local_addr()?,
            proxy = %proxy_listener.local_addr()?,
            require_client_cert = self.config.require_client_cert,
            "wtun-server listening"
        );

        let (slot, mut established_rx) = TunnelSlot::new();
        let acceptor = TlsAcceptor::from(self.tls_config.clone());
        tokio::spawn(listener::accept_tunnels(
            tunnel_listener,
            acceptor,
            slot.clone(),
            Arc::from(self.config.key_hash.as_str()),
            self.config.handshake_timeout,
        ));
        tokio::spawn(listener::accept_local(proxy_listener, slot.clone()));

        let (registry_tx, registry_rx) = watch::channel(Arc::new(ConnectionRegistry::new()));
        spawn_count_reporter(registry_rx, COUNT_REPORT_PERIOD);

        info!("awaiting tunnel connection");
        let mut tunnel = established_rx
            .recv()
            .await
            .context("tunnel listener stopped")?;
        loop {
            registry_tx.send_replace(tunnel.registry.clone());
            dispatch(&mut tunnel).await;
            tunnel = slot
                .new_tunnel_connection(&mut established_rx)
                .await
                .context("tunnel listener stopped")?;
        }
    }
}

/// Read envelopes from the tunnel until it is lost.
pub async fn dispatch(tunnel: &mut EstablishedTunnel) {
    loop {
        let frame = match read_frame(&mut tunnel.reader, Role::Server.expects_masked()).await {
            Ok(frame) => frame,
            Err(e) if e.is_disconnect() => {
                info!(error = %e, "tunnel connection lost");
                return;
            }
            Err(e) => {
                warn!(error = %e, "invalid frame on tunnel");
                return;
            }
        };

        let message = Message::deserialize(&frame);
        debug!(kind = ?message.kind, conn_id = message.connection_id, "message from tunnel");
        match message.kind {
            MessageKind::Close => {
                tunnel.registry.remove(message.connection_id).await;
            }
            MessageKind::Message => tunnel.registry.send_message(&message).await,
            MessageKind::Open => {
                debug!(conn_id = message.connection_id, "ignoring open from tunnel client");
            }
            MessageKind::TunnelClosed => {
                info!("tunnel closed by peer");
                return;
            }
        }
    }
}
