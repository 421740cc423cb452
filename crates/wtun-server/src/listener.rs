//! Server side of the tunnel session.
//!
//! Two accept loops run in the background:
//! - the **tunnel** listener takes candidate agent connections, runs TLS and
//!   the upgrade handshake under a timeout, and offers the result to the
//!   [`TunnelSlot`]. Only the first candidate wins; every other one is closed.
//! - the **local** listener (loopback proxy port) starts an inbound pump per
//!   accepted socket while a tunnel is up, and closes sockets otherwise.
//!
//! The slot's mutex only guards single assignment of the tunnel. Frame
//! writes are serialized separately inside [`TunnelWriter`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use wtun_core::pump::ConnectionHandle;
use wtun_core::tunnel::{self, TunnelIo};
use wtun_core::{handshake, pump, ConnectionRegistry, Role, TunnelError, TunnelReader, TunnelWriter};

/// A freshly established tunnel, handed to the dispatch loop.
pub struct EstablishedTunnel {
    pub reader: TunnelReader,
    pub writer: TunnelWriter,
    pub registry: Arc<ConnectionRegistry>,
}

struct ActiveTunnel {
    writer: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
}

/// Holds the current tunnel, if any.
pub struct TunnelSlot {
    current: Mutex<Option<ActiveTunnel>>,
    established_tx: mpsc::Sender<EstablishedTunnel>,
}

impl TunnelSlot {
    /// Create an empty slot. Winning tunnels arrive on the returned receiver.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<EstablishedTunnel>) {
        let (established_tx, established_rx) = mpsc::channel(1);
        let slot = Arc::new(Self {
            current: Mutex::new(None),
            established_tx,
        });
        (slot, established_rx)
    }

    pub async fn is_set(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Offer an authenticated stream as the tunnel.
    ///
    /// Returns `false` and closes the stream when a tunnel is already set.
    pub async fn try_install<S>(&self, mut stream: S) -> bool
    where
        S: TunnelIo + 'static,
    {
        let mut current = self.current.lock().await;
        if current.is_some() {
            drop(current);
            let _ = stream.shutdown().await;
            return false;
        }

        let (reader, writer) = tunnel::split(stream, Role::Server);
        let registry = Arc::new(ConnectionRegistry::new());
        *current = Some(ActiveTunnel {
            writer: writer.clone(),
            registry: registry.clone(),
        });
        let established = EstablishedTunnel {
            reader,
            writer,
            registry,
        };
        if self.established_tx.try_send(established).is_err() {
            warn!("dispatch loop is gone, tunnel not handed over");
        }
        true
    }

    /// Writer and registry of the current tunnel, for new local connections.
    async fn current(&self) -> Option<(TunnelWriter, Arc<ConnectionRegistry>)> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|t| (t.writer.clone(), t.registry.clone()))
    }

    /// Keep a freshly opened local connection only if `writer` still belongs
    /// to the current tunnel.
    ///
    /// A connection accepted just before the tunnel was replaced can register
    /// after the old registry was purged; it is dropped here instead of
    /// lingering until the old writer fails.
    async fn retain_if_current(
        &self,
        writer: &TunnelWriter,
        registry: &ConnectionRegistry,
        handle: &Arc<ConnectionHandle>,
    ) -> bool {
        let still_current = self
            .current()
            .await
            .is_some_and(|(current, _)| current.same_transport(writer));
        if !still_current {
            debug!(conn_id = handle.id(), "tunnel replaced while opening, dropping connection");
            registry.deregister(handle).await;
        }
        still_current
    }

    /// Drop the current tunnel and wait for the next one.
    ///
    /// Every connection of the old tunnel is closed before waiting.
    pub async fn new_tunnel_connection(
        &self,
        established_rx: &mut mpsc::Receiver<EstablishedTunnel>,
    ) -> Option<EstablishedTunnel> {
        let old = self.current.lock().await.take();
        if let Some(old) = old {
            old.registry.remove_all().await;
            // A writer stuck on a dead peer must not delay the next tunnel.
            tokio::spawn(async move { old.writer.shutdown().await });
        }
        info!("tunnel disconnected, waiting for new connection");
        established_rx.recv().await
    }
}

/// Accept candidate tunnel agents forever.
pub async fn accept_tunnels(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    slot: Arc<TunnelSlot>,
    key_hash: Arc<str>,
    handshake_timeout: Duration,
) {
    let mut attempt: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                attempt += 1;
                info!(remote = %remote, attempt, "tunnel connection accepted");
                let acceptor = acceptor.clone();
                let slot = slot.clone();
                let key_hash = key_hash.clone();
                tokio::spawn(async move {
                    handle_candidate(
                        stream,
                        remote,
                        attempt,
                        acceptor,
                        slot,
                        key_hash,
                        handshake_timeout,
                    )
                    .await;
                });
            }
            Err(e) => {
                error!(error = %e, "tunnel accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_candidate(
    stream: TcpStream,
    remote: SocketAddr,
    attempt: u64,
    acceptor: TlsAcceptor,
    slot: Arc<TunnelSlot>,
    key_hash: Arc<str>,
    handshake_timeout: Duration,
) {
    if slot.is_set().await {
        info!(remote = %remote, attempt, "tunnel already active, closing candidate");
        return;
    }
    let _ = stream.set_nodelay(true);

    let result = tokio::time::timeout(handshake_timeout, async {
        let mut tls = acceptor.accept(stream).await?;
        if slot.is_set().await {
            return Err(TunnelError::HandshakeRejected(
                "tunnel already active".into(),
            ));
        }
        handshake::server_handshake(&mut tls, &key_hash).await?;
        Ok(tls)
    })
    .await;

    let tls = match result {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(remote = %remote, attempt, error = %e, "tunnel handshake failed");
            return;
        }
        Err(_) => {
            warn!(remote = %remote, attempt, "tunnel handshake timed out");
            return;
        }
    };

    if slot.try_install(tls).await {
        info!(remote = %remote, attempt, "tunnel established");
    } else {
        info!(remote = %remote, attempt, "tunnel already active, closed late candidate");
    }
}

/// Accept local clients on the proxy port forever.
pub async fn accept_local(listener: TcpListener, slot: Arc<TunnelSlot>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "local accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some((writer, registry)) = slot.current().await else {
            debug!(remote = %remote, "no tunnel, closing local connection");
            continue;
        };
        let slot = slot.clone();
        tokio::spawn(async move {
            match pump::accept_inbound(stream, writer.clone(), registry.clone()).await {
                Ok(handle) => {
                    slot.retain_if_current(&writer, &registry, &handle).await;
                }
                Err(e) => debug!(remote = %remote, error = %e, "local connection not started"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wtun_core::frame::read_frame;
    use wtun_core::Message;

    #[tokio::test]
    async fn only_first_candidate_wins() {
        let (slot, mut established_rx) = TunnelSlot::new();
        let mut tasks = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..8 {
            let (ours, peer) = tokio::io::duplex(1024);
            peers.push(peer);
            let slot = slot.clone();
            tasks.push(tokio::spawn(async move { slot.try_install(ours).await }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(slot.is_set().await);

        let established = established_rx.recv().await.unwrap();
        established.writer.send(&Message::open(1)).await.unwrap();

        // Losers were shut down, the winner carries the frame.
        let mut closed = 0;
        for mut peer in peers {
            let mut byte = [0u8; 1];
            match peer.read(&mut byte).await.unwrap() {
                0 => closed += 1,
                _ => assert_eq!(byte[0], 0x82),
            }
        }
        assert_eq!(closed, 7);
    }

    #[tokio::test]
    async fn new_tunnel_purges_old_registry() {
        let (slot, mut established_rx) = TunnelSlot::new();
        let (first, mut first_peer) = tokio::io::duplex(1024);
        assert!(slot.try_install(first).await);
        let old = established_rx.recv().await.unwrap();

        let (local, _app) = tokio::io::duplex(64);
        pump::start_outbound(local, 42, old.writer.clone(), old.registry.clone())
            .await
            .unwrap();
        assert_eq!(old.registry.count().await, 1);

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.new_tunnel_connection(&mut established_rx).await })
        };

        // Old transport gets shut down.
        let mut rest = Vec::new();
        first_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (second, _second_peer) = tokio::io::duplex(1024);
        assert!(slot.try_install(second).await);
        let new = waiter.await.unwrap().unwrap();

        assert_eq!(old.registry.count().await, 0);
        assert_eq!(old.registry.purges(), 1);
        assert!(!Arc::ptr_eq(&old.registry, &new.registry));
        assert!(!old.writer.same_transport(&new.writer));
    }

    #[tokio::test]
    async fn local_connection_racing_replacement_is_dropped() {
        let (slot, mut established_rx) = TunnelSlot::new();
        let (ours, _peer) = tokio::io::duplex(1 << 16);
        assert!(slot.try_install(ours).await);
        let old = established_rx.recv().await.unwrap();

        let (local, _app) = tokio::io::duplex(1024);
        let kept = pump::start_inbound(local, 4, old.writer.clone(), old.registry.clone())
            .await
            .unwrap();
        assert!(slot.retain_if_current(&old.writer, &old.registry, &kept).await);

        // Replacement takes the tunnel and purges it while this one is opening.
        slot.current.lock().await.take();
        old.registry.remove_all().await;
        let (local, mut app) = tokio::io::duplex(1024);
        let late = pump::start_inbound(local, 5, old.writer.clone(), old.registry.clone())
            .await
            .unwrap();
        assert_eq!(old.registry.count().await, 1);

        assert!(!slot.retain_if_current(&old.writer, &old.registry, &late).await);
        assert_eq!(old.registry.count().await, 0);
        assert!(late.is_closed());
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    mod over_tls {
        use super::*;
        use tokio_rustls::client::TlsStream;
        use tokio_rustls::TlsConnector;
        use wtun_core::tls::{self, TlsMaterial};
        use wtun_core::{token, TunnelResult};

        async fn serve(
            key_hash: &str,
        ) -> (SocketAddr, Arc<TunnelSlot>, mpsc::Receiver<EstablishedTunnel>) {
            let material = TlsMaterial::self_signed("TunnelServer").unwrap();
            let acceptor =
                TlsAcceptor::from(Arc::new(tls::server_config(&material, true).unwrap()));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (slot, established_rx) = TunnelSlot::new();
            tokio::spawn(accept_tunnels(
                listener,
                acceptor,
                slot.clone(),
                Arc::from(key_hash),
                Duration::from_secs(5),
            ));
            (addr, slot, established_rx)
        }

        async fn agent(addr: SocketAddr, key: &str) -> TunnelResult<TlsStream<TcpStream>> {
            let material = TlsMaterial::self_signed("TunnelClient")?;
            let connector = TlsConnector::from(Arc::new(tls::client_config(&material)?));
            let tcp = TcpStream::connect(addr).await?;
            let mut stream = connector
                .connect(tls::server_name("TunnelServer")?, tcp)
                .await?;
            handshake::client_handshake(&mut stream, "127.0.0.1", key).await?;
            Ok(stream)
        }

        #[tokio::test]
        async fn authenticated_agent_becomes_the_tunnel() {
            let key = token::generate_key(40).unwrap();
            let (addr, slot, mut established_rx) = serve(&token::hash_key(&key).unwrap()).await;

            let mut first = agent(addr, &key).await.unwrap();
            let tunnel = tokio::time::timeout(Duration::from_secs(5), established_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(slot.is_set().await);

            tunnel.writer.send(&Message::open(77)).await.unwrap();
            let frame = read_frame(&mut first, Role::Client.expects_masked())
                .await
                .unwrap();
            assert_eq!(Message::deserialize(&frame), Message::open(77));

            // With a tunnel in place, later candidates are closed.
            assert!(agent(addr, &key).await.is_err());
            assert!(established_rx.try_recv().is_err());
        }

        #[tokio::test]
        async fn wrong_key_installs_nothing() {
            let key = token::generate_key(40).unwrap();
            let (addr, slot, mut established_rx) = serve(&token::hash_key(&key).unwrap()).await;

            let other = token::generate_key(40).unwrap();
            let err = agent(addr, &other).await.unwrap_err();
            assert!(matches!(err, TunnelError::HandshakeRejected(_)));
            assert!(!slot.is_set().await);
            assert!(established_rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn local_connections_closed_without_tunnel() {
        let (slot, _established_rx) = TunnelSlot::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_local(listener, slot));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn local_connection_opens_through_tunnel() {
        let (slot, mut established_rx) = TunnelSlot::new();
        let (ours, mut peer) = tokio::io::duplex(1 << 16);
        assert!(slot.try_install(ours).await);
        let tunnel = established_rx.recv().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_local(listener, slot));

        let client = TcpStream::connect(addr).await.unwrap();
        let port = i32::from(client.local_addr().unwrap().port());

        let frame = read_frame(&mut peer, false).await.unwrap();
        assert_eq!(Message::deserialize(&frame), Message::open(port));
        assert_eq!(tunnel.registry.count().await, 1);
    }
}
