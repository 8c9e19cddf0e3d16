//! Ed25519 signing and verification
//!
//! Signatures cover the message cid (SHA-256 of the canonical message
//! encoding), not the raw payload, so a signature stays valid for exactly one
//! canonical encoding of the message.

use crate::error::{Error, Result};
use crate::message::{Message, Signature, SCHEME_ED25519};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;

/// An Ed25519 keypair used to author messages.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Public verifying key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message: computes the cid and signs it.
    pub fn sign<P: Serialize>(&self, message: &Message<P>) -> Result<Signature> {
        let cid = message.cid()?;
        let signature = self.signing.sign(&cid);
        Ok(Signature {
            scheme: SCHEME_ED25519.to_string(),
            public_key: self.public_key().to_vec(),
            signature: signature.to_bytes().to_vec(),
            cid,
        })
    }
}

/// Verify a signature over its embedded cid.
pub fn verify(signature: &Signature) -> Result<()> {
    if signature.scheme != SCHEME_ED25519 {
        return Err(Error::UnknownSignatureScheme(signature.scheme.clone()));
    }

    let key_bytes: [u8; 32] = signature
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidPublicKey(format!("expected 32 bytes, got {}", signature.public_key.len())))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = signature
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    key.verify_strict(&signature.cid, &sig)
        .map_err(|_| Error::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message<Vec<u8>> {
        Message {
            topic: "test".into(),
            clock: 1,
            parents: vec![],
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(&message()).unwrap();
        verify(&signature).unwrap();
    }

    #[test]
    fn test_verify_rejects_flipped_cid() {
        let keypair = KeyPair::generate();
        let mut signature = keypair.sign(&message()).unwrap();
        signature.cid[0] ^= 0xff;
        assert!(matches!(verify(&signature), Err(Error::InvalidSignature)));
    }

    #[test]
    fn test_verify_rejects_unknown_scheme() {
        let keypair = KeyPair::generate();
        let mut signature = keypair.sign(&message()).unwrap();
        signature.scheme = "secp256k1".into();
        assert!(matches!(
            verify(&signature),
            Err(Error::UnknownSignatureScheme(_))
        ));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = KeyPair::from_seed([9; 32]);
        let b = KeyPair::from_seed([9; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }
}
