//! Canonical encoding for GossipLog
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - No maps/hashmaps
//! - Field order is Rust struct field order
//! - Optional fields encode as an explicit presence byte, never ambiguity
//!
//! Message ids and signature cids are SHA-256 digests over these bytes, so
//! implementations in other languages MUST produce identical encodings.

use crate::error::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// SHA-256 digest of a byte string.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
