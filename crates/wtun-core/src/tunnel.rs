//! The shared tunnel transport.
//!
//! A tunnel stream is split once: the dispatch loop owns the read half, and
//! every pump plus the dispatch loop itself write through a cloned
//! [`TunnelWriter`]. Writes are serialized by one mutex so each envelope
//! reaches the wire as a whole frame.

use crate::error::TunnelResult;
use crate::message::Message;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

/// A bidirectional byte stream usable as a tunnel transport.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Read half of a tunnel, owned by the dispatch loop.
pub type TunnelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Clients mask outgoing frames, servers do not.
    pub fn masks_outgoing(self) -> bool {
        self == Role::Client
    }

    /// Whether frames read from the peer must be masked.
    pub fn expects_masked(self) -> bool {
        self == Role::Server
    }
}

/// Serialized writer onto the tunnel transport.
#[derive(Clone)]
pub struct TunnelWriter {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    masked: bool,
}

impl TunnelWriter {
    /// Wrap a write half; `role` decides whether frames are masked.
    pub fn new<W>(writer: W, role: Role) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            masked: role.masks_outgoing(),
        }
    }

    /// Write one envelope as a complete frame.
    pub async fn send(&self, message: &Message) -> TunnelResult<()> {
        let frame = message.serialize(self.masked)?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(
            kind = ?message.kind,
            conn_id = message.connection_id,
            len = frame.len(),
            "frame written"
        );
        Ok(())
    }

    /// Shut down the write side of the transport.
    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Whether two writers share the same underlying transport.
    pub fn same_transport(&self, other: &TunnelWriter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for TunnelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelWriter")
            .field("masked", &self.masked)
            .finish_non_exhaustive()
    }
}

/// Split an established tunnel stream into its dispatch reader and shared writer.
pub fn split<S>(stream: S, role: Role) -> (TunnelReader, TunnelWriter)
where
    S: TunnelIo + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), TunnelWriter::new(writer, role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use crate::message::MessageKind;

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (_client_reader, writer) = split(client, Role::Client);
        let (mut server_reader, _server_writer) = split(server, Role::Server);

        let mut tasks = Vec::new();
        for id in 0..8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let payload = vec![id as u8; 3000];
                    writer.send(&Message::data(id, payload)).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            for _ in 0..160 {
                let frame = read_frame(&mut server_reader, true).await.unwrap();
                let msg = Message::deserialize(&frame);
                assert_eq!(msg.kind, MessageKind::Message);
                let payload = msg.payload.unwrap();
                assert_eq!(payload.len(), 3000);
                assert!(payload.iter().all(|&b| b == msg.connection_id as u8));
            }
        });

        for task in tasks {
            task.await.unwrap();
        }
        reader.await.unwrap();
    }

    #[test]
    fn role_masking() {
        assert!(Role::Client.masks_outgoing());
        assert!(!Role::Client.expects_masked());
        assert!(!Role::Server.masks_outgoing());
        assert!(Role::Server.expects_masked());
    }
}
