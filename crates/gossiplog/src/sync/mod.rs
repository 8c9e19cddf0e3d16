//! Merkle-tree set reconciliation between two replicas
//!
//! The initiator runs a [`Driver`] against a responder's tree, descending
//! only into subtrees whose hashes differ, and fetches the leaf values it is
//! missing. The responder side is a [`SyncServer`] answering four request
//! kinds; every response mirrors its request's sequence number so responses
//! can be correlated on a single bidirectional stream.

pub mod driver;
pub mod server;

pub use driver::Driver;
pub use server::SyncServer;

use crate::events::LogEvent;
use crate::log::{GossipLog, LogError};
use crate::store::{MessageStore, StoreError};
use crate::tree::{Node, TreeStore};
use gossiplog_core::MessageId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("sync session timed out")]
    Timeout,
    #[error("sync session aborted")]
    Aborted,
    #[error("sync channel closed")]
    ChannelClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Requests an initiator sends to a responder.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SyncRequest {
    GetRoot { seq: u64 },
    GetNode { seq: u64, level: u32, key: Option<Vec<u8>> },
    GetChildren { seq: u64, level: u32, key: Option<Vec<u8>> },
    GetValues { seq: u64, keys: Vec<MessageId> },
}

impl SyncRequest {
    pub fn seq(&self) -> u64 {
        match self {
            Self::GetRoot { seq }
            | Self::GetNode { seq, .. }
            | Self::GetChildren { seq, .. }
            | Self::GetValues { seq, .. } => *seq,
        }
    }
}

/// Responses, mirroring the request's sequence number. Absent nodes are a
/// `None`, never an error: absence is a normal outcome while diffing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SyncResponse {
    Root { seq: u64, root: Node },
    Node { seq: u64, node: Option<Node> },
    Children { seq: u64, children: Option<Vec<Node>> },
    Values { seq: u64, values: Vec<Option<Vec<u8>>> },
}

impl SyncResponse {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Root { seq, .. }
            | Self::Node { seq, .. }
            | Self::Children { seq, .. }
            | Self::Values { seq, .. } => *seq,
        }
    }
}

/// The driver's view of the responder's tree, local or remote.
#[allow(async_fn_in_trait)]
pub trait SyncSource {
    async fn get_root(&mut self) -> Result<Node, SyncError>;
    async fn get_node(&mut self, level: u32, key: Option<&[u8]>)
        -> Result<Option<Node>, SyncError>;
    async fn get_children(
        &mut self,
        level: u32,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<Node>>, SyncError>;
    async fn get_values(&mut self, keys: &[MessageId])
        -> Result<Vec<Option<Vec<u8>>>, SyncError>;
}

/// In-process source over a local tree and store, for tests and same-process
/// replicas.
pub struct LocalSource<'a, T: TreeStore + ?Sized, S: MessageStore + ?Sized> {
    tree: &'a T,
    store: &'a S,
}

impl<'a, T: TreeStore + ?Sized, S: MessageStore + ?Sized> LocalSource<'a, T, S> {
    pub fn new(tree: &'a T, store: &'a S) -> Self {
        Self { tree, store }
    }
}

impl<'a, T: TreeStore + ?Sized, S: MessageStore + ?Sized> SyncSource for LocalSource<'a, T, S> {
    async fn get_root(&mut self) -> Result<Node, SyncError> {
        Ok(self.tree.root()?)
    }

    async fn get_node(
        &mut self,
        level: u32,
        key: Option<&[u8]>,
    ) -> Result<Option<Node>, SyncError> {
        Ok(self.tree.node(level, key)?)
    }

    async fn get_children(
        &mut self,
        level: u32,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<Node>>, SyncError> {
        Ok(self.tree.children(level, key)?)
    }

    async fn get_values(
        &mut self,
        keys: &[MessageId],
    ) -> Result<Vec<Option<Vec<u8>>>, SyncError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.store.get(key)?);
        }
        Ok(values)
    }
}

/// Outcome of one sync session.
#[derive(Clone, Copy, Debug)]
pub struct SyncStats {
    pub message_count: usize,
    pub duration: Duration,
}

impl<P, S, T> GossipLog<P, S, T>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: MessageStore,
    T: TreeStore,
{
    /// Pull every entry we are missing from `source` and insert it.
    ///
    /// Entries arriving before their parents are deferred via the mempool
    /// exactly as in the gossip path; invalid or rejected entries are logged
    /// and dropped without aborting the session. Each applied entry is
    /// incremental, so an aborted session leaves a valid log behind.
    pub async fn sync_from<Src: SyncSource>(
        &self,
        peer: &str,
        source: &mut Src,
    ) -> Result<SyncStats, SyncError> {
        let started = Instant::now();
        let mut count = 0usize;

        let mut driver = Driver::new(source, self.tree());
        while let Some((id, value)) = driver.next_missing().await? {
            match self.insert(&value) {
                Ok(_) => count += 1,
                Err(LogError::Validation(e)) => {
                    warn!(%id, error = %e, "dropping invalid synced message");
                }
                Err(LogError::Rejected(reason)) => {
                    warn!(%id, %reason, "dropping rejected synced message");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let duration = started.elapsed();
        info!(peer, message_count = count, ?duration, "sync session complete");
        self.publish(LogEvent::Sync {
            peer: peer.to_string(),
            message_count: count,
            duration,
        });
        Ok(SyncStats {
            message_count: count,
            duration,
        })
    }
}
