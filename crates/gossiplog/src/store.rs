//! Durable message storage
//!
//! The log depends only on the narrow [`MessageStore`] contract: point
//! lookups, ascending range scans with a limit, and a metadata table. Two
//! implementations are provided, an in-memory store for tests and embedding,
//! and a sled-backed store for persistence.

use gossiplog_core::MessageId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] gossiplog_core::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Ascending id range with optional inclusive/exclusive bounds.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdRange {
    /// Lower bound and whether it is inclusive.
    pub lower: Option<(MessageId, bool)>,
    /// Upper bound and whether it is inclusive.
    pub upper: Option<(MessageId, bool)>,
}

impl IdRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn gt(mut self, id: MessageId) -> Self {
        self.lower = Some((id, false));
        self
    }

    pub fn gte(mut self, id: MessageId) -> Self {
        self.lower = Some((id, true));
        self
    }

    pub fn lt(mut self, id: MessageId) -> Self {
        self.upper = Some((id, false));
        self
    }

    pub fn lte(mut self, id: MessageId) -> Self {
        self.upper = Some((id, true));
        self
    }

    fn bounds(&self) -> (Bound<MessageId>, Bound<MessageId>) {
        let lower = match self.lower {
            Some((id, true)) => Bound::Included(id),
            Some((id, false)) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let upper = match self.upper {
            Some((id, true)) => Bound::Included(id),
            Some((id, false)) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }
}

/// Narrow storage contract the log core depends on.
pub trait MessageStore: Send + Sync {
    /// Fetch the stored envelope bytes for an id.
    fn get(&self, id: &MessageId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Whether an id is durably present.
    fn contains(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Store envelope bytes under an id. Overwriting an existing id with the
    /// same bytes is a no-op (content-addressed keys are hash-stable).
    fn put(&self, id: &MessageId, value: &[u8]) -> Result<(), StoreError>;

    /// Ascending scan of at most `limit` entries within `range`.
    fn scan(&self, range: &IdRange, limit: usize) -> Result<Vec<(MessageId, Vec<u8>)>, StoreError>;

    /// Number of stored messages.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Read a metadata record (heads, schema version).
    fn meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a metadata record.
    fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Flush pending writes to durable media.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<BTreeMap<MessageId, Vec<u8>>>,
    meta: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn get(&self, id: &MessageId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.messages.read().get(id).cloned())
    }

    fn contains(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.messages.read().contains_key(id))
    }

    fn put(&self, id: &MessageId, value: &[u8]) -> Result<(), StoreError> {
        self.messages.write().insert(*id, value.to_vec());
        Ok(())
    }

    fn scan(&self, range: &IdRange, limit: usize) -> Result<Vec<(MessageId, Vec<u8>)>, StoreError> {
        let messages = self.messages.read();
        Ok(messages
            .range(range.bounds())
            .take(limit)
            .map(|(id, value)| (*id, value.clone()))
            .collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.messages.read().len())
    }

    fn meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.meta.read().get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.meta.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Persistent store backed by sled.
pub struct SledStore {
    db: sled::Db,
    /// Message tree: message_id -> envelope bytes
    messages: sled::Tree,
    /// Metadata tree: key -> value
    meta: sled::Tree,
}

impl SledStore {
    /// Open storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let messages = db.open_tree("messages")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, messages, meta })
    }
}

impl MessageStore for SledStore {
    fn get(&self, id: &MessageId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.messages.get(id.as_bytes())?.map(|v| v.to_vec()))
    }

    fn contains(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.messages.contains_key(id.as_bytes())?)
    }

    fn put(&self, id: &MessageId, value: &[u8]) -> Result<(), StoreError> {
        self.messages.insert(id.as_bytes(), value)?;
        Ok(())
    }

    fn scan(&self, range: &IdRange, limit: usize) -> Result<Vec<(MessageId, Vec<u8>)>, StoreError> {
        let (lower, upper) = range.bounds();
        let lower = match &lower {
            Bound::Included(id) => Bound::Included(id.as_bytes().to_vec()),
            Bound::Excluded(id) => Bound::Excluded(id.as_bytes().to_vec()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match &upper {
            Bound::Included(id) => Bound::Included(id.as_bytes().to_vec()),
            Bound::Excluded(id) => Bound::Excluded(id.as_bytes().to_vec()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut out = Vec::new();
        for entry in self.messages.range((lower, upper)).take(limit) {
            let (key, value) = entry?;
            let id = MessageId::from_bytes(&key)
                .map_err(|e| StoreError::Corrupt(format!("bad message key: {e}")))?;
            out.push((id, value.to_vec()));
        }
        Ok(out)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.messages.len())
    }

    fn meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.meta.get(key)?.map(|v| v.to_vec()))
    }

    fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.meta.insert(key, value)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
