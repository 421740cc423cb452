use thiserror::Error;

/// Errors produced by the wtun protocol layer.
///
/// The set is closed so callers can branch on the kind of failure: frame
/// errors end the current tunnel, handshake errors reject one candidate
/// connection, and per-connection errors stay inside one pump.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid frame prefix: 0x{0:02x}")]
    InvalidFramePrefix(u8),

    #[error("mask mismatch (expected masked: {expected_masked})")]
    MaskMismatch { expected_masked: bool },

    #[error("frame too big: {0} bytes")]
    FrameTooLarge(u64),

    #[error("frame size exceeded while appending payload")]
    FrameOverflow,

    #[error("frame is not complete: {written} of {expected} bytes written")]
    FrameIncomplete { written: usize, expected: usize },

    #[error("connection closed while expecting more data")]
    ConnectionClosed,

    #[error("header block too large")]
    HeadersTooLarge,

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection id already registered: {0}")]
    DuplicateConnection(i32),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    /// Whether the peer or the network went away, as opposed to the peer
    /// sending something invalid.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TunnelError::ConnectionClosed | TunnelError::Io(_))
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(e: rustls::Error) -> Self {
        TunnelError::Tls(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TunnelError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TunnelError::Timeout
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
