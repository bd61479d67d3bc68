//! Stream identifiers
//!
//! A stream id is the 16-byte routing key that binds an IO channel to an
//! external consumer. Operators either supply one literally (32 hex
//! digits) or let the tooling derive one deterministically from the
//! channel's addressing path (agent address, codeletset, codelet, hook,
//! direction, channel name).

use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a stream id in bytes.
pub const STREAM_ID_LEN: usize = 16;

/// 16-byte opaque identifier routing an IO channel to a consumer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamId(pub [u8; STREAM_ID_LEN]);

/// Errors raised when parsing a literal stream id.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StreamIdError {
    /// The hex string is not exactly 32 digits.
    #[error("stream id must be {expected} hex digits, got {0}", expected = STREAM_ID_LEN * 2)]
    InvalidLength(usize),

    /// The string contains a non-hex character.
    #[error("stream id contains invalid hex: {0}")]
    InvalidHex(String),
}

impl StreamId {
    /// Build a stream id from raw bytes.
    pub fn from_bytes(bytes: [u8; STREAM_ID_LEN]) -> Self {
        StreamId(bytes)
    }

    /// Parse a 32-hex-digit literal.
    pub fn from_hex(s: &str) -> Result<Self, StreamIdError> {
        if s.len() != STREAM_ID_LEN * 2 {
            return Err(StreamIdError::InvalidLength(s.len()));
        }
        let raw = hex::decode(s).map_err(|_| StreamIdError::InvalidHex(s.to_string()))?;
        let mut id = [0u8; STREAM_ID_LEN];
        id.copy_from_slice(&raw);
        Ok(StreamId(id))
    }

    /// Derive a stream id deterministically from a path of seed strings.
    ///
    /// The digest is SHA-256 over each seed prefixed by its byte length,
    /// truncated to 16 bytes. Length prefixing keeps distinct seed
    /// vectors from colliding by concatenation, and the result is stable
    /// across runs, platforms and compiler versions.
    pub fn derive(seeds: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update((seed.len() as u64).to_le_bytes());
            hasher.update(seed.as_bytes());
        }
        let digest = hasher.finalize();
        let mut id = [0u8; STREAM_ID_LEN];
        id.copy_from_slice(&digest[..STREAM_ID_LEN]);
        StreamId(id)
    }

    /// Render as 32 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.to_hex())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
