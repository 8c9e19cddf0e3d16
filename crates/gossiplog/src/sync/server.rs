//! Sync responder: answers tree and value queries
//!
//! Stateless over a tree and store reference; every response mirrors the
//! request's sequence number. Absent nodes answer "not found" (`None`), never
//! an error.

use super::{SyncRequest, SyncResponse};
use crate::store::{MessageStore, StoreError};
use crate::tree::TreeStore;

/// Sync session responder.
pub struct SyncServer<'a, T: TreeStore + ?Sized, S: MessageStore + ?Sized> {
    tree: &'a T,
    store: &'a S,
}

impl<'a, T: TreeStore + ?Sized, S: MessageStore + ?Sized> SyncServer<'a, T, S> {
    pub fn new(tree: &'a T, store: &'a S) -> Self {
        Self { tree, store }
    }

    pub fn handle(&self, request: &SyncRequest) -> Result<SyncResponse, StoreError> {
        match request {
            SyncRequest::GetRoot { seq } => Ok(SyncResponse::Root {
                seq: *seq,
                root: self.tree.root()?,
            }),
            SyncRequest::GetNode { seq, level, key } => Ok(SyncResponse::Node {
                seq: *seq,
                node: self.tree.node(*level, key.as_deref())?,
            }),
            SyncRequest::GetChildren { seq, level, key } => Ok(SyncResponse::Children {
                seq: *seq,
                children: self.tree.children(*level, key.as_deref())?,
            }),
            SyncRequest::GetValues { seq, keys } => {
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    values.push(self.store.get(key)?);
                }
                Ok(SyncResponse::Values { seq: *seq, values })
            }
        }
    }
}
