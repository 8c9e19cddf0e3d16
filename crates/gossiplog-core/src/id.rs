//! Canonical message identifiers
//!
//! A message id is a fixed 20-byte key: the unsigned-varint encoding of the
//! message's logical clock, followed by the leading bytes of the SHA-256
//! digest of the signed message envelope. Ids whose clocks varint-encode to
//! equal lengths sort lexicographically by clock, with the digest prefix
//! acting as tie-breaker and content fingerprint at once.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a message id in bytes.
pub const ID_LEN: usize = 20;

/// Canonical 20-byte message key.
///
/// Ordering caveat: clocks whose varint encodings differ in byte length are
/// only approximately ordered by the raw key bytes (a 1-byte clock prefix can
/// compare above a 2-byte one). Iteration order over ids is therefore
/// "approximately ascending by clock"; nothing in this workspace assumes
/// strict clock order across that boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; ID_LEN]", into = "[u8; ID_LEN]")]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    /// Construct an id from a clock and the message's SHA-256 digest.
    pub fn encode(clock: u64, digest: &[u8; 32]) -> Self {
        let mut key = [0u8; ID_LEN];
        let n = write_varint(&mut key, clock);
        key[n..].copy_from_slice(&digest[..ID_LEN - n]);
        Self(key)
    }

    /// Parse an id from raw bytes, validating length and clock prefix.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("expected {ID_LEN} bytes, got {}", bytes.len())))?;
        read_varint(&key)?;
        Ok(Self(key))
    }

    /// The raw 20-byte key.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Parse the leading clock varint.
    pub fn clock(&self) -> u64 {
        // A constructed id always carries a complete varint prefix.
        let (clock, _) = read_varint(&self.0).expect("message id has a valid clock prefix");
        clock
    }
}

impl TryFrom<[u8; ID_LEN]> for MessageId {
    type Error = Error;

    fn try_from(key: [u8; ID_LEN]) -> Result<Self> {
        read_varint(&key)?;
        Ok(Self(key))
    }
}

impl From<MessageId> for [u8; ID_LEN] {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

/// Compute the clock a message with the given parents must declare.
///
/// `1 + max(parent clocks)`, or `1` for a root message with no parents.
pub fn clock_from_parents(parents: &[MessageId]) -> u64 {
    1 + parents.iter().map(|p| p.clock()).max().unwrap_or(0)
}

/// Number of bytes the unsigned-varint encoding of `value` occupies.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn write_varint(buf: &mut [u8], mut value: u64) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::InvalidId("clock varint overflows u64".into()));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::InvalidId("truncated clock varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: u8) -> [u8; 32] {
        [seed; 32]
    }

    #[test]
    fn test_varint_len() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16383), 2);
        assert_eq!(varint_len(16384), 3);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn test_clock_roundtrip() {
        for clock in [0u64, 1, 127, 128, 255, 16383, 16384, 1 << 40, u64::MAX] {
            let id = MessageId::encode(clock, &digest(0xab));
            assert_eq!(id.clock(), clock);
            assert_eq!(id.as_bytes().len(), ID_LEN);
        }
    }

    #[test]
    fn test_digest_fills_remainder() {
        let id = MessageId::encode(1, &digest(0xcd));
        // 1-byte varint, 19 digest bytes
        assert_eq!(id.as_bytes()[0], 1);
        assert_eq!(&id.as_bytes()[1..], &[0xcd; 19][..]);
    }

    #[test]
    fn test_ordering_within_varint_length() {
        // Clocks that encode to the same varint length sort by clock first.
        let a = MessageId::encode(1, &digest(0xff));
        let b = MessageId::encode(2, &digest(0x00));
        assert!(a < b);

        let c = MessageId::encode(200, &digest(0xff));
        let d = MessageId::encode(300, &digest(0x00));
        assert!(c < d);
    }

    #[test]
    fn test_hash_breaks_ties() {
        let a = MessageId::encode(7, &digest(0x01));
        let b = MessageId::encode(7, &digest(0x02));
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(MessageId::from_bytes(&[0u8; 19]).is_err());
        assert!(MessageId::from_bytes(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_truncated_varint() {
        // Every byte has the continuation bit set.
        assert!(MessageId::from_bytes(&[0x80u8; ID_LEN]).is_err());
    }

    #[test]
    fn test_clock_from_parents() {
        assert_eq!(clock_from_parents(&[]), 1);

        let p1 = MessageId::encode(3, &digest(1));
        let p2 = MessageId::encode(5, &digest(2));
        assert_eq!(clock_from_parents(&[p1]), 4);
        assert_eq!(clock_from_parents(&[p1, p2]), 6);
    }
}
