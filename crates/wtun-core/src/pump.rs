//! Connection pumps: one per local TCP connection carried over the tunnel.
//!
//! A pump owns both halves of a local byte stream. The read half lives in a
//! spawned task that wraps every chunk in a `Message` envelope and writes it
//! onto the shared tunnel; the write half sits behind a [`ConnectionHandle`]
//! stored in the [`ConnectionRegistry`], where the dispatch loop delivers
//! payloads coming the other way.
//!
//! Two variants exist:
//! - **inbound**: a local client connected to us (server proxy port). The
//!   pump announces itself to the peer with `Open`.
//! - **outbound**: the peer sent `Open`, so we dial the configured target.
//!   A failed dial is answered with `Close`.

use crate::error::{TunnelError, TunnelResult};
use crate::message::Message;
use crate::registry::ConnectionRegistry;
use crate::tunnel::TunnelWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Size of the buffer each pump reads its local socket into.
pub const READ_BUFFER_SIZE: usize = 20_000;

type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The registry's view of a running pump.
///
/// Holds the local write half and the cancel signal for the read task.
/// Closing is idempotent: the first close shuts the write half down and
/// stops the reader, later ones are logged and ignored.
pub struct ConnectionHandle {
    id: i32,
    writer: Mutex<Option<LocalWriter>>,
    cancel_tx: mpsc::Sender<()>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Wrap a local write half. The returned receiver fires when the
    /// connection is closed through the handle.
    pub fn new<W>(id: i32, writer: W) -> (Arc<Self>, mpsc::Receiver<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let handle = Arc::new(Self {
            id,
            writer: Mutex::new(Some(Box::new(writer))),
            cancel_tx,
            closed: AtomicBool::new(false),
        });
        (handle, cancel_rx)
    }

    /// Connection id this pump is registered under.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write tunnel payload to the local socket.
    pub async fn write(&self, data: &[u8]) -> TunnelResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TunnelError::ConnectionClosed)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the local socket and stop the read task.
    pub async fn close_connection(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(conn_id = self.id, "close of already closed connection");
            return;
        }
        let _ = self.cancel_tx.try_send(());
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(conn_id = self.id, error = %e, "local shutdown failed");
            }
        }
        debug!(conn_id = self.id, "local connection closed");
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Start a pump for a local client accepted on the proxy port.
///
/// The connection id is the client's source port.
pub async fn accept_inbound(
    stream: TcpStream,
    tunnel: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
) -> TunnelResult<Arc<ConnectionHandle>> {
    let peer = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let id = i32::from(peer.port());
    debug!(conn_id = id, peer = %peer, "local connection accepted");
    start_inbound(stream, id, tunnel, registry).await
}

/// Register an inbound pump under `id`, announce it with `Open`, and start reading.
///
/// A duplicate id closes the stream without telling the peer anything.
pub async fn start_inbound<S>(
    stream: S,
    id: i32,
    tunnel: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
) -> TunnelResult<Arc<ConnectionHandle>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, handle, cancel_rx) = register(stream, id, &registry).await?;

    if let Err(e) = tunnel.send(&Message::open(id)).await {
        warn!(conn_id = id, error = %e, "failed to send open");
        registry.deregister(&handle).await;
        return Err(e);
    }

    spawn_read_loop(reader, handle.clone(), cancel_rx, tunnel, registry);
    Ok(handle)
}

/// Dial `target` for a connection the peer opened.
///
/// On dial failure a best-effort `Close` goes back to the peer and nothing
/// is registered.
pub async fn dial_outbound(
    target: &str,
    id: i32,
    tunnel: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
    dial_timeout: Duration,
) -> TunnelResult<Arc<ConnectionHandle>> {
    let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(conn_id = id, target, error = %e, "dial failed");
            send_close(&tunnel, id).await;
            return Err(e.into());
        }
        Err(_) => {
            warn!(conn_id = id, target, "dial timed out");
            send_close(&tunnel, id).await;
            return Err(TunnelError::Timeout);
        }
    };
    let _ = stream.set_nodelay(true);
    debug!(conn_id = id, target, "dialed target");
    start_outbound(stream, id, tunnel, registry).await
}

/// Register an outbound pump for an already connected stream and start reading.
pub async fn start_outbound<S>(
    stream: S,
    id: i32,
    tunnel: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
) -> TunnelResult<Arc<ConnectionHandle>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, handle, cancel_rx) = register(stream, id, &registry).await?;
    spawn_read_loop(reader, handle.clone(), cancel_rx, tunnel, registry);
    Ok(handle)
}

async fn register<S>(
    stream: S,
    id: i32,
    registry: &ConnectionRegistry,
) -> TunnelResult<(
    tokio::io::ReadHalf<S>,
    Arc<ConnectionHandle>,
    mpsc::Receiver<()>,
)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (handle, cancel_rx) = ConnectionHandle::new(id, writer);
    if let Err(e) = registry.add(handle.clone()).await {
        warn!(conn_id = id, "connection id already in use, dropping connection");
        return Err(e);
    }
    Ok((reader, handle, cancel_rx))
}

fn spawn_read_loop<R>(
    reader: R,
    handle: Arc<ConnectionHandle>,
    cancel_rx: mpsc::Receiver<()>,
    tunnel: TunnelWriter,
    registry: Arc<ConnectionRegistry>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let id = handle.id();
        read_loop(reader, &handle, cancel_rx, &tunnel, &registry).await;
        debug!(conn_id = id, "pump ended");
    });
}

/// Local socket → tunnel. At most one read is outstanding at a time.
async fn read_loop<R>(
    mut reader: R,
    handle: &Arc<ConnectionHandle>,
    mut cancel_rx: mpsc::Receiver<()>,
    tunnel: &TunnelWriter,
    registry: &ConnectionRegistry,
) where
    R: AsyncRead + Unpin,
{
    let id = handle.id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.recv() => {
                // Closed through the registry: the peer already knows, or the
                // whole tunnel is gone.
                debug!(conn_id = id, "pump cancelled");
                return;
            }
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(conn_id = id, "local end closed");
                        send_close(tunnel, id).await;
                        break;
                    }
                    Ok(n) => {
                        let message = Message::data(id, buf[..n].to_vec());
                        if let Err(e) = tunnel.send(&message).await {
                            info!(conn_id = id, error = %e, "tunnel write failed, dropping connection");
                            send_close(tunnel, id).await;
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn_id = id, error = %e, "local read failed");
                        send_close(tunnel, id).await;
                        break;
                    }
                }
            }
        }
    }

    registry.deregister(handle).await;
}

/// Tell the peer a connection is gone. Failures are only logged.
async fn send_close(tunnel: &TunnelWriter, id: i32) {
    if let Err(e) = tunnel.send(&Message::close(id)).await {
        debug!(conn_id = id, error = %e, "close not delivered");
    }
}
