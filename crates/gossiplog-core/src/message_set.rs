//! Sets of message ids, used to track log heads
//!
//! The canonical encoding is an ordered array of raw 20-byte ids, so two
//! replicas with the same frontier produce identical bytes.

use crate::canonical::canonical_bytes;
use crate::error::Result;
use crate::id::MessageId;
use std::collections::btree_set;
use std::collections::BTreeSet;

/// An ordered set of message ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageSet {
    ids: BTreeSet<MessageId>,
}

impl MessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id; returns false if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.ids.insert(id)
    }

    /// Remove an id; returns false if it was absent.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Smallest id by key order.
    pub fn min(&self) -> Option<&MessageId> {
        self.ids.first()
    }

    /// Largest id by key order.
    pub fn max(&self) -> Option<&MessageId> {
        self.ids.last()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, MessageId> {
        self.ids.iter()
    }

    /// Ids in ascending key order.
    pub fn to_vec(&self) -> Vec<MessageId> {
        self.ids.iter().copied().collect()
    }

    /// Canonical encoding: an ordered array of raw ids.
    pub fn encode(&self) -> Result<Vec<u8>> {
        canonical_bytes(&self.to_vec())
    }

    /// Decode a set from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let ids: Vec<MessageId> = postcard::from_bytes(bytes)?;
        Ok(ids.into_iter().collect())
    }
}

impl FromIterator<MessageId> for MessageSet {
    fn from_iter<I: IntoIterator<Item = MessageId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a MessageSet {
    type Item = &'a MessageId;
    type IntoIter = btree_set::Iter<'a, MessageId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}
