//! Multiplexing envelope carried inside each frame.
//!
//! Wire format: `[1-byte kind][4-byte connection id LE][payload]`.
//! Only `Message` envelopes carry a payload.

use crate::error::TunnelResult;
use crate::frame::FrameBuilder;
use tracing::debug;

/// Envelope header length: kind + connection id.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Open = 0,
    Close = 1,
    Message = 2,
    TunnelClosed = 3,
}

impl MessageKind {
    /// Decode a wire kind byte; unknown values yield `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Message),
            3 => Some(Self::TunnelClosed),
            _ => None,
        }
    }
}

/// One envelope on the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub connection_id: i32,
    pub payload: Option<Vec<u8>>,
}

impl Message {
    /// Announce a new logical connection.
    pub fn open(connection_id: i32) -> Self {
        Self {
            kind: MessageKind::Open,
            connection_id,
            payload: None,
        }
    }

    /// Tear down a logical connection.
    pub fn close(connection_id: i32) -> Self {
        Self {
            kind: MessageKind::Close,
            connection_id,
            payload: None,
        }
    }

    /// Carry bytes for a logical connection.
    pub fn data(connection_id: i32, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Message,
            connection_id,
            payload: Some(payload),
        }
    }

    /// Ends the tunnel. [`Message::deserialize`] also yields it for input
    /// that does not parse.
    pub fn tunnel_closed() -> Self {
        Self {
            kind: MessageKind::TunnelClosed,
            connection_id: 0,
            payload: None,
        }
    }

    /// Serialize into a complete frame, masked or not.
    pub fn serialize(&self, masked: bool) -> TunnelResult<Vec<u8>> {
        let payload = self.payload.as_deref().unwrap_or_default();
        let mut frame = FrameBuilder::new(HEADER_LEN + payload.len(), masked);
        frame.append(&[self.kind as u8])?;
        frame.append(&self.connection_id.to_le_bytes())?;
        frame.append(payload)?;
        frame.finish()
    }

    /// Parse a frame payload.
    ///
    /// Anything that does not parse becomes [`MessageKind::TunnelClosed`]:
    /// a byte stream that is out of sync cannot be trusted any further.
    pub fn deserialize(buffer: &[u8]) -> Self {
        if buffer.len() < HEADER_LEN {
            debug!(len = buffer.len(), "envelope too short");
            return Self::tunnel_closed();
        }
        let Some(kind) = MessageKind::from_u8(buffer[0]) else {
            debug!(kind = buffer[0], "unknown envelope kind");
            return Self::tunnel_closed();
        };
        let connection_id = i32::from_le_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
        let payload = match kind {
            MessageKind::Message => Some(buffer[HEADER_LEN..].to_vec()),
            _ => None,
        };
        Self {
            kind,
            connection_id,
            payload,
        }
    }
}
