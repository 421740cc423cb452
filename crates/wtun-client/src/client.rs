//! Tunnel client: keeps one tunnel to the server alive and dials the target
//! for every connection the server opens through it.

use crate::connector::{self, Dialer, RetryPolicy};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wtun_core::frame::read_frame;
use wtun_core::registry::spawn_count_reporter;
use wtun_core::{pump, ConnectionRegistry, Message, MessageKind, Role, TunnelReader, TunnelWriter};

/// How often the live connection count is logged.
const COUNT_REPORT_PERIOD: Duration = Duration::from_millis(7500);

pub struct TunnelClient<D> {
    dialer: D,
    target: String,
    policy: RetryPolicy,
    dial_timeout: Duration,
}

impl<D: Dialer> TunnelClient<D> {
    pub fn new(dialer: D, target: String, policy: RetryPolicy, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            target,
            policy,
            dial_timeout,
        }
    }

    /// Connect and serve until the tunnel is lost for good.
    ///
    /// The first connection gets a single attempt; later losses go through
    /// [`connector::reconnect`].
    pub async fn run(self) -> anyhow::Result<()> {
        let (mut reader, mut writer) = self
            .dialer
            .dial()
            .await
            .context("can't connect to server")?;

        let mut registry = Arc::new(ConnectionRegistry::new());
        let (registry_tx, registry_rx) = watch::channel(registry.clone());
        spawn_count_reporter(registry_rx, COUNT_REPORT_PERIOD);

        loop {
            dispatch(
                &mut reader,
                &writer,
                &registry,
                &self.target,
                self.dial_timeout,
            )
            .await;

            let lost = writer.clone();
            tokio::spawn(async move { lost.shutdown().await });

            (reader, writer) = connector::reconnect(&self.dialer, &registry, self.policy)
                .await
                .context("failed to reconnect to tunnel server")?;
            registry = Arc::new(ConnectionRegistry::new());
            registry_tx.send_replace(registry.clone());
            info!("tunnel re-established");
        }
    }
}

/// Read envelopes from the tunnel until it is lost.
pub async fn dispatch(
    reader: &mut TunnelReader,
    writer: &TunnelWriter,
    registry: &Arc<ConnectionRegistry>,
    target: &str,
    dial_timeout: Duration,
) {
    loop {
        let frame = match read_frame(reader, Role::Client.expects_masked()).await {
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
            MessageKind::Open => {
                let id = message.connection_id;
                if let Err(e) =
                    pump::dial_outbound(target, id, writer.clone(), registry.clone(), dial_timeout)
                        .await
                {
                    debug!(conn_id = id, error = %e, "open not served");
                }
            }
            MessageKind::Close => {
                registry.remove(message.connection_id).await;
            }
            MessageKind::Message => registry.send_message(&message).await,
            MessageKind::TunnelClosed => {
                info!("tunnel closed by peer");
                return;
            }
        }
    }
}
