//! wtun-core: protocol library for the wtun TCP tunnel.
//!
//! Provides the WebSocket frame codec, the upgrade handshake, the
//! multiplexing envelope, the per-tunnel connection registry, connection
//! pumps, and TLS setup shared by `wtun-server` and `wtun-client`.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod pump;
pub mod registry;
pub mod tls;
pub mod token;
pub mod tunnel;

// Re-export commonly used items at crate root.
pub use error::{TunnelError, TunnelResult};
pub use message::{Message, MessageKind};
pub use registry::ConnectionRegistry;
pub use tunnel::{Role, TunnelReader, TunnelWriter};
