//! Pre-shared bearer tokens for tunnel authentication.
//!
//! The client holds the raw secret as a hex string and sends it as
//! `Authorization: Bearer <hex>`. The server only knows `hex(SHA-256(secret))`.

use crate::error::{TunnelError, TunnelResult};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Longest key `generate_key` will produce, in bytes.
pub const MAX_KEY_LEN: usize = 100;

/// Generate a random secret of `len` bytes, hex-encoded.
pub fn generate_key(len: usize) -> TunnelResult<String> {
    if len == 0 || len > MAX_KEY_LEN {
        return Err(TunnelError::Other(format!(
            "key length must be between 1 and {MAX_KEY_LEN} bytes, got {len}"
        )));
    }
    let mut key = vec![0u8; len];
    rand::thread_rng().fill(&mut key[..]);
    Ok(hex::encode(key))
}

/// Hash a hex-encoded secret: `hex(SHA-256(bytes))`.
pub fn hash_key(hex_key: &str) -> TunnelResult<String> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| TunnelError::AuthFailed(format!("token is not valid hex: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Check a bearer token against the configured hash.
pub fn verify_bearer(hex_key: &str, expected_hash: &str) -> TunnelResult<()> {
    let actual = hash_key(hex_key)?;
    let expected = expected_hash.trim().to_ascii_lowercase();
    if constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(TunnelError::AuthFailed("token hash mismatch".into()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
