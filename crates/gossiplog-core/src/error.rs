//! Error types for GossipLog core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// GossipLog core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Malformed message id (wrong length, truncated clock varint)
    #[error("invalid message id: {0}")]
    InvalidId(String),

    /// Declared clock does not match the parents' clocks
    #[error("clock mismatch: declared {declared}, expected {expected}")]
    ClockMismatch { declared: u64, expected: u64 },

    /// Topic policy requires a signature and the message carries none
    #[error("missing required signature")]
    MissingSignature,

    /// Signature scheme is not one we know how to verify
    #[error("unknown signature scheme: {0}")]
    UnknownSignatureScheme(String),

    /// Signature does not verify over the message cid
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature cid does not match the message's canonical digest
    #[error("cid mismatch: signature does not cover this message")]
    CidMismatch,
}
