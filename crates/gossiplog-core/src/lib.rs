//! GossipLog Core Library
//!
//! This crate provides the canonical types and codecs for GossipLog, the
//! per-topic, content-addressed, causally-ordered append log.
//!
//! # Modules
//!
//! - [`id`]: 20-byte message ids (clock varint + digest prefix)
//! - [`message`]: messages, signatures, and the signed wire envelope
//! - [`message_set`]: ordered id sets used for log heads
//! - [`canonical`]: deterministic serialization for hashing/signing
//! - [`crypto`]: Ed25519 signing and verification
//! - [`error`]: error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod id;
pub mod message;
pub mod message_set;

pub use canonical::{canonical_bytes, sha256};
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use id::{clock_from_parents, MessageId, ID_LEN};
pub use message::{Message, Signature, SignaturePolicy, SignedMessage, SCHEME_ED25519};
pub use message_set::MessageSet;
