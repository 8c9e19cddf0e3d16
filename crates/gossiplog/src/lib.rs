//! GossipLog - per-topic causally-ordered append log
//!
//! This crate provides:
//! - Durable message storage behind a narrow trait (in-memory and sled)
//! - A deterministic Merkle Search Tree over the message key space
//! - A mempool tolerating out-of-order delivery of causal messages
//! - The log core: append, insert, iterate, replay, heads, events
//! - Merkle-tree set reconciliation (sync driver and server)

pub mod events;
pub mod log;
pub mod mempool;
pub mod merkle_index;
pub mod store;
pub mod sync;
pub mod tree;

pub use events::LogEvent;
pub use log::{
    AppendResult, Apply, ApplyError, GossipLog, InsertOutcome, LogConfig, LogError, LogState,
    Migration, NoopApply,
};
pub use mempool::Mempool;
pub use merkle_index::{rebuild_tree, MerkleIndex};
pub use store::{IdRange, MemoryStore, MessageStore, SledStore, StoreError};
pub use sync::{
    Driver, LocalSource, SyncError, SyncRequest, SyncResponse, SyncServer, SyncSource, SyncStats,
};
pub use tree::{node_id, MemoryTree, Node, SledTree, TreeStore};
