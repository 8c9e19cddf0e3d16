//! Messages and their signed wire envelope
//!
//! A stored message is the canonical 2-or-3-tuple `[signature?, message]`,
//! postcard-encoded in declaration order. The SHA-256 digest of that envelope
//! seeds the message id; the signature (when present) covers the cid, the
//! digest of the inner message alone.

use crate::canonical::{canonical_bytes, sha256};
use crate::crypto;
use crate::error::{Error, Result};
use crate::id::{clock_from_parents, MessageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Signature scheme identifier for Ed25519.
pub const SCHEME_ED25519: &str = "ed25519";

/// Per-topic signature policy.
///
/// When signatures are disabled the clock is pinned to `0` and ordering is
/// purely structural (ids order by digest alone).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    #[default]
    Required,
    Disabled,
}

/// A causally-ordered log message with an application-defined payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message<P> {
    pub topic: String,
    pub clock: u64,
    pub parents: Vec<MessageId>,
    pub payload: P,
}

impl<P: Serialize> Message<P> {
    /// SHA-256 digest of the canonical message encoding (without signature).
    ///
    /// This is the content identifier a signature covers.
    pub fn cid(&self) -> Result<[u8; 32]> {
        Ok(sha256(&canonical_bytes(self)?))
    }
}

/// Signature over a message cid.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    pub scheme: String,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub cid: [u8; 32],
}

/// The signed wire envelope: `[signature?, message]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignedMessage<P> {
    pub signature: Option<Signature>,
    pub message: Message<P>,
}

impl<P: Serialize> SignedMessage<P> {
    /// Canonical envelope bytes, as stored and gossiped.
    pub fn encode(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// SHA-256 digest of the canonical envelope bytes.
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(sha256(&self.encode()?))
    }

    /// The message id: varint clock prefix plus digest remainder.
    pub fn id(&self) -> Result<MessageId> {
        Ok(MessageId::encode(self.message.clock, &self.digest()?))
    }

    /// Structural validation against the topic's signature policy.
    ///
    /// Checks the clock/parent arithmetic exactly (a mismatch is rejected,
    /// never corrected), the cid binding, and the signature itself.
    pub fn validate(&self, policy: SignaturePolicy) -> Result<()> {
        match policy {
            SignaturePolicy::Required => {
                let signature = self.signature.as_ref().ok_or(Error::MissingSignature)?;

                let expected = clock_from_parents(&self.message.parents);
                if self.message.clock != expected {
                    return Err(Error::ClockMismatch {
                        declared: self.message.clock,
                        expected,
                    });
                }

                if signature.cid != self.message.cid()? {
                    return Err(Error::CidMismatch);
                }

                crypto::verify(signature)
            }
            SignaturePolicy::Disabled => {
                if self.message.clock != 0 {
                    return Err(Error::ClockMismatch {
                        declared: self.message.clock,
                        expected: 0,
                    });
                }
                Ok(())
            }
        }
    }
}

impl<P: DeserializeOwned> SignedMessage<P> {
    /// Decode an envelope from canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn message(clock: u64, parents: Vec<MessageId>) -> Message<String> {
        Message {
            topic: "test".into(),
            clock,
            parents,
            payload: "hello".into(),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let keypair = KeyPair::from_seed([7; 32]);
        let msg = message(1, vec![]);
        let signature = keypair.sign(&msg).unwrap();
        let signed = SignedMessage {
            signature: Some(signature),
            message: msg,
        };

        let bytes = signed.encode().unwrap();
        let decoded: SignedMessage<String> = SignedMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.id().unwrap(), signed.id().unwrap());
    }

    #[test]
    fn test_id_is_pure_function_of_content() {
        let keypair = KeyPair::from_seed([7; 32]);
        let msg = message(1, vec![]);
        let signature = keypair.sign(&msg).unwrap();
        let a = SignedMessage {
            signature: Some(signature.clone()),
            message: msg.clone(),
        };
        let b = SignedMessage {
            signature: Some(signature),
            message: msg,
        };
        assert_eq!(a.id().unwrap(), b.id().unwrap());

        // A different payload yields a different id.
        let other = Message {
            payload: "world".to_string(),
            ..b.message.clone()
        };
        let sig = keypair.sign(&other).unwrap();
        let c = SignedMessage {
            signature: Some(sig),
            message: other,
        };
        assert_ne!(b.id().unwrap(), c.id().unwrap());
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let keypair = KeyPair::from_seed([1; 32]);
        let msg = message(1, vec![]);
        let signed = SignedMessage {
            signature: Some(keypair.sign(&msg).unwrap()),
            message: msg,
        };
        signed.validate(SignaturePolicy::Required).unwrap();
    }

    #[test]
    fn test_validate_rejects_clock_mismatch() {
        let keypair = KeyPair::from_seed([1; 32]);
        let msg = message(5, vec![]); // must be 1 with no parents
        let signed = SignedMessage {
            signature: Some(keypair.sign(&msg).unwrap()),
            message: msg,
        };
        assert!(matches!(
            signed.validate(SignaturePolicy::Required),
            Err(Error::ClockMismatch {
                declared: 5,
                expected: 1
            })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_signature() {
        let signed = SignedMessage {
            signature: None,
            message: message(1, vec![]),
        };
        assert!(matches!(
            signed.validate(SignaturePolicy::Required),
            Err(Error::MissingSignature)
        ));
    }

    #[test]
    fn test_validate_rejects_tampered_payload() {
        let keypair = KeyPair::from_seed([1; 32]);
        let msg = message(1, vec![]);
        let signature = keypair.sign(&msg).unwrap();
        let tampered = SignedMessage {
            signature: Some(signature),
            message: Message {
                payload: "tampered".to_string(),
                ..msg
            },
        };
        assert!(matches!(
            tampered.validate(SignaturePolicy::Required),
            Err(Error::CidMismatch)
        ));
    }

    #[test]
    fn test_unsigned_policy_pins_clock_to_zero() {
        let ok = SignedMessage {
            signature: None,
            message: message(0, vec![]),
        };
        ok.validate(SignaturePolicy::Disabled).unwrap();

        let bad = SignedMessage {
            signature: None,
            message: message(1, vec![]),
        };
        assert!(bad.validate(SignaturePolicy::Disabled).is_err());
    }
}
