//! Registry of live logical connections for one tunnel instance.
//!
//! Maps a connection id to the handle of the pump that owns the local
//! socket. Lookups for tunnel data share a read lock; registration and
//! removal take the write lock. A fresh registry is created for every
//! tunnel instance, so a pump from a dead tunnel can never land in the
//! registry of its replacement.

use crate::error::{TunnelError, TunnelResult};
use crate::message::Message;
use crate::pump::ConnectionHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace};

/// Live connections of one tunnel instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<i32, Arc<ConnectionHandle>>>,
    purges: AtomicU64,
}

impl ConnectionRegistry {
    /// An empty registry for a new tunnel instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pump. Fails if the id is already taken.
    pub async fn add(&self, handle: Arc<ConnectionHandle>) -> TunnelResult<()> {
        let id = handle.id();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(TunnelError::DuplicateConnection(id));
        }
        connections.insert(id, handle);
        debug!(conn_id = id, "connection registered");
        Ok(())
    }

    /// Close and forget the connection with `id`.
    ///
    /// Returns `false` (and only logs) when no such connection exists.
    pub async fn remove(&self, id: i32) -> bool {
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(handle) => {
                handle.close_connection().await;
                debug!(conn_id = id, "connection removed");
                true
            }
            None => {
                debug!(conn_id = id, "remove of unknown connection");
                false
            }
        }
    }

    /// Remove `handle` only if it is still the registered entry for its id.
    ///
    /// Pumps deregister themselves this way so a late teardown cannot evict
    /// a newer connection that reused the same id.
    pub async fn deregister(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let id = handle.id();
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&id) {
                Some(current) if Arc::ptr_eq(current, handle) => connections.remove(&id),
                _ => None,
            }
        };
        handle.close_connection().await;
        match removed {
            Some(_) => {
                debug!(conn_id = id, "connection deregistered");
                true
            }
            None => {
                debug!(conn_id = id, "deregister of connection no longer registered");
                false
            }
        }
    }

    /// Close and clear every connection. Returns how many were closed.
    pub async fn remove_all(&self) -> usize {
        let drained: Vec<Arc<ConnectionHandle>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.close_connection().await;
        }
        let purge = self.purges.fetch_add(1, Ordering::SeqCst) + 1;
        info!(count = drained.len(), purge, "removed all connections");
        drained.len()
    }

    /// Forward a `Message` envelope's payload to its local connection.
    ///
    /// Unknown ids are dropped: the peer may have closed that connection
    /// while data was still in flight. A failed local write deregisters the
    /// connection.
    pub async fn send_message(&self, message: &Message) {
        let id = message.connection_id;
        let handle = self.connections.read().await.get(&id).cloned();
        let Some(handle) = handle else {
            debug!(conn_id = id, "message for unknown connection dropped");
            return;
        };
        let payload = message.payload.as_deref().unwrap_or_default();
        if let Err(e) = handle.write(payload).await {
            debug!(conn_id = id, error = %e, "local write failed, dropping connection");
            self.deregister(&handle).await;
            return;
        }
        trace!(conn_id = id, len = payload.len(), "forwarded to local connection");
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// How many times [`remove_all`](Self::remove_all) has run.
    pub fn purges(&self) -> u64 {
        self.purges.load(Ordering::SeqCst)
    }
}

/// Log the number of live connections of the current registry every `period`.
pub fn spawn_count_reporter(
    current: watch::Receiver<Arc<ConnectionRegistry>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let registry = current.borrow().clone();
            let count = registry.count().await;
            info!(connections = count, "connection count");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::ConnectionHandle;
    use tokio::io::AsyncReadExt;

    fn handle(id: i32) -> (Arc<ConnectionHandle>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (_reader, writer) = tokio::io::split(local);
        let (handle, _cancel_rx) = ConnectionHandle::new(id, writer);
        (handle, remote)
    }

    #[tokio::test]
    async fn add_rejects_duplicate_id() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = handle(7);
        let (b, _rb) = handle(7);
        registry.add(a).await.unwrap();
        assert!(matches!(
            registry.add(b).await,
            Err(TunnelError::DuplicateConnection(7))
        ));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn send_message_writes_to_local_side() {
        let registry = ConnectionRegistry::new();
        let (h, mut remote) = handle(3);
        registry.add(h).await.unwrap();

        registry.send_message(&Message::data(3, b"hello".to_vec())).await;
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn send_after_remove_is_noop() {
        let registry = ConnectionRegistry::new();
        let (h, mut remote) = handle(9);
        registry.add(h.clone()).await.unwrap();
        assert!(registry.remove(9).await);
        assert!(h.is_closed());

        registry.send_message(&Message::data(9, b"late".to_vec())).await;
        assert!(!registry.remove(9).await);

        // The local side sees EOF, not the late payload.
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn deregister_ignores_newer_entry_with_same_id() {
        let registry = ConnectionRegistry::new();
        let (old, _ro) = handle(5);
        let (new, _rn) = handle(5);
        registry.add(old.clone()).await.unwrap();
        assert!(registry.remove(5).await);
        registry.add(new.clone()).await.unwrap();

        assert!(!registry.deregister(&old).await);
        assert_eq!(registry.count().await, 1);
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn remove_all_with_concurrent_sends() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut remotes = Vec::new();
        for id in 0..32 {
            let (h, remote) = handle(id);
            registry.add(h).await.unwrap();
            remotes.push(remote);
        }

        let mut senders = Vec::new();
        for id in 0..32 {
            let registry = registry.clone();
            senders.push(tokio::spawn(async move {
                for _ in 0..10 {
                    registry.send_message(&Message::data(id, vec![1])).await;
                }
            }));
        }

        let purged = registry.remove_all().await;
        assert_eq!(purged, 32);
        assert_eq!(registry.count().await, 0);
        assert_eq!(registry.purges(), 1);

        for s in senders {
            s.await.unwrap();
        }
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn count_reporter_does_not_block_registry_swaps() {
        let first = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = watch::channel(first.clone());

        // Holding the map parks the reporter inside `count`.
        let guard = first.connections.write().await;
        let reporter = spawn_count_reporter(rx, Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let swap = tokio::task::spawn_blocking(move || {
            tx.send_replace(Arc::new(ConnectionRegistry::new()));
            tx
        });
        let _tx = tokio::time::timeout(Duration::from_secs(2), swap)
            .await
            .unwrap()
            .unwrap();

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reporter.is_finished());
        reporter.abort();
    }
}
