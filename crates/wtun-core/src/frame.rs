//! WebSocket binary frame codec for the tunnel transport.
//!
//! Only single, unfragmented binary frames are produced and accepted:
//!
//! ```text
//! +--------+----------------+--------------------+------------+---------+
//! | 0x82   | M | len7 (1)   | ext len (0/2/8)    | mask (0/4) | payload |
//! +--------+----------------+--------------------+------------+---------+
//! ```
//!
//! `len7` is the length itself up to 125, `126` for a 16-bit extended length
//! and `127` for a 64-bit one. Extended lengths are little-endian, matching
//! the agents already deployed on the other end of the tunnel.

use crate::error::{TunnelError, TunnelResult};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

/// FIN=1, opcode=binary.
pub const FRAME_PREFIX: u8 = 0x82;

/// Largest payload accepted from the wire (10 MiB).
pub const MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

const MASK_BIT: u8 = 0x80;
const MAX_INLINE_LEN: u64 = 0x7D;
const LEN_16: u8 = 0x7E;
const LEN_64: u8 = 0x7F;

/// Size of the frame header for a payload of `payload_len` bytes.
pub fn frame_size(payload_len: u64, masked: bool) -> usize {
    let mut size = 2;
    if payload_len > MAX_INLINE_LEN && payload_len <= u16::MAX as u64 {
        size += 2;
    } else if payload_len > u16::MAX as u64 {
        size += 8;
    }
    if masked {
        size += 4;
    }
    size
}

/// XOR `buffer` in place with the 4-byte mask key, starting at key offset 0.
pub fn apply_mask(buffer: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Incremental frame writer with a payload length fixed up front.
///
/// The header (and mask key, if any) is written on construction; payload
/// chunks are masked as they are appended. Appending past the declared
/// length or finishing short are both errors.
#[derive(Debug)]
pub struct FrameBuilder {
    buffer: Vec<u8>,
    header_len: usize,
    total_len: usize,
    mask_key: Option<[u8; 4]>,
}

impl FrameBuilder {
    /// Start a frame for exactly `payload_len` payload bytes. A masked frame
    /// gets a fresh random mask key.
    pub fn new(payload_len: usize, masked: bool) -> Self {
        let header_len = frame_size(payload_len as u64, masked);
        let total_len = header_len + payload_len;
        let mut buffer = Vec::with_capacity(total_len);

        buffer.push(FRAME_PREFIX);
        let mask_bit = if masked { MASK_BIT } else { 0 };
        let len = payload_len as u64;
        if len <= MAX_INLINE_LEN {
            buffer.push(len as u8 | mask_bit);
        } else if len <= u16::MAX as u64 {
            buffer.push(LEN_16 | mask_bit);
            buffer.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            buffer.push(LEN_64 | mask_bit);
            buffer.extend_from_slice(&len.to_le_bytes());
        }

        let mask_key = if masked {
            let mut key = [0u8; 4];
            rand::thread_rng().fill(&mut key[..]);
            buffer.extend_from_slice(&key);
            Some(key)
        } else {
            None
        };

        Self {
            buffer,
            header_len,
            total_len,
            mask_key,
        }
    }

    /// The mask key written into the header, if the frame is masked.
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask_key
    }

    /// Append payload bytes.
    pub fn append(&mut self, data: &[u8]) -> TunnelResult<()> {
        if data.len() > self.total_len - self.buffer.len() {
            return Err(TunnelError::FrameOverflow);
        }
        match self.mask_key {
            Some(key) => {
                for &b in data {
                    let offset = self.buffer.len() - self.header_len;
                    self.buffer.push(b ^ key[offset % 4]);
                }
            }
            None => self.buffer.extend_from_slice(data),
        }
        Ok(())
    }

    /// Return the finished frame bytes.
    pub fn finish(self) -> TunnelResult<Vec<u8>> {
        if self.buffer.len() < self.total_len {
            return Err(TunnelError::FrameIncomplete {
                written: self.buffer.len(),
                expected: self.total_len,
            });
        }
        Ok(self.buffer)
    }
}

/// Encode `payload` as a single binary frame.
pub fn encode(payload: &[u8], masked: bool) -> TunnelResult<Vec<u8>> {
    let mut builder = FrameBuilder::new(payload.len(), masked);
    builder.append(payload)?;
    builder.finish()
}

/// Read one binary frame from `reader` and return its (unmasked) payload.
///
/// The server side expects masked frames and the client side unmasked ones;
/// a frame with the other masking is rejected.
pub async fn read_frame<R>(reader: &mut R, expect_masked: bool) -> TunnelResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    read_full(reader, &mut head).await?;

    if head[0] != FRAME_PREFIX {
        return Err(TunnelError::InvalidFramePrefix(head[0]));
    }

    let masked = head[1] & MASK_BIT != 0;
    if masked != expect_masked {
        return Err(TunnelError::MaskMismatch {
            expected_masked: expect_masked,
        });
    }

    let len7 = head[1] & !MASK_BIT;
    let len = match len7 {
        LEN_16 => {
            let mut ext = [0u8; 2];
            read_full(reader, &mut ext).await?;
            u16::from_le_bytes(ext) as u64
        }
        LEN_64 => {
            let mut ext = [0u8; 8];
            read_full(reader, &mut ext).await?;
            u64::from_le_bytes(ext)
        }
        n => n as u64,
    };
    if len > MAX_FRAME_SIZE {
        return Err(TunnelError::FrameTooLarge(len));
    }

    let mut mask_key = [0u8; 4];
    if masked {
        read_full(reader, &mut mask_key).await?;
    }

    let mut payload = vec![0u8; len as usize];
    read_full(reader, &mut payload).await?;
    if masked {
        apply_mask(&mut payload, mask_key);
    }
    Ok(payload)
}

/// Fill `buf` completely, mapping a short read to [`TunnelError::ConnectionClosed`].
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TunnelError::ConnectionClosed)
        }
        Err(e) => Err(TunnelError::Io(e)),
    }
}
