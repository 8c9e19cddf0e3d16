//! Rebuild cursor from the durable store into the Merkle tree
//!
//! Projects the message store into an ordered stream of `(id, value hash)`
//! pairs via paginated ascending scans, so the full id space never has to fit
//! in memory. Used to (re)materialize a tree on cold start or after a schema
//! migration invalidates it.

use crate::store::{IdRange, MessageStore, StoreError};
use crate::tree::TreeStore;
use gossiplog_core::{sha256, MessageId};
use std::collections::VecDeque;

/// Default rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Paginated `(id, hash)` cursor over a message store.
pub struct MerkleIndex<'a, S: MessageStore + ?Sized> {
    store: &'a S,
    page_size: usize,
}

impl<'a, S: MessageStore + ?Sized> MerkleIndex<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(store: &'a S, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        Self { store, page_size }
    }

    /// Restartable, finite stream of `(id, sha256(value))` in id order.
    pub fn entries(&self) -> Entries<'a, S> {
        Entries {
            store: self.store,
            page_size: self.page_size,
            page: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }
}

/// Iterator state for one pass over the store.
pub struct Entries<'a, S: MessageStore + ?Sized> {
    store: &'a S,
    page_size: usize,
    page: VecDeque<(MessageId, [u8; 32])>,
    last: Option<MessageId>,
    exhausted: bool,
}

impl<'a, S: MessageStore + ?Sized> Iterator for Entries<'a, S> {
    type Item = Result<(MessageId, [u8; 32]), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            let range = match self.last {
                Some(last) => IdRange::all().gt(last),
                None => IdRange::all(),
            };
            let rows = match self.store.scan(&range, self.page_size) {
                Ok(rows) => rows,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            };
            if rows.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some((id, _)) = rows.last() {
                self.last = Some(*id);
            }
            self.page
                .extend(rows.into_iter().map(|(id, value)| (id, sha256(&value))));
        }

        self.page.pop_front().map(Ok)
    }
}

/// Rebuild a tree's leaf set from the store.
pub fn rebuild_tree<S, T>(store: &S, tree: &T) -> Result<(), StoreError>
where
    S: MessageStore + ?Sized,
    T: TreeStore + ?Sized,
{
    tree.rebuild(&mut MerkleIndex::new(store).entries())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tree::MemoryTree;

    fn seed(store: &MemoryStore, count: u64) -> Vec<MessageId> {
        let mut ids = Vec::new();
        for i in 1..=count {
            let value = i.to_be_bytes();
            let id = MessageId::encode(i, &sha256(&value));
            store.put(&id, &value).unwrap();
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_entries_cover_store_in_order() {
        let store = MemoryStore::new();
        let ids = seed(&store, 10);

        let index = MerkleIndex::with_page_size(&store, 3);
        let entries: Vec<_> = index.entries().collect::<Result<_, _>>().unwrap();

        assert_eq!(entries.len(), 10);
        assert_eq!(entries.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        for (i, (_, hash)) in entries.iter().enumerate() {
            assert_eq!(*hash, sha256(&(i as u64 + 1).to_be_bytes()));
        }
    }

    #[test]
    fn test_entries_on_empty_store() {
        let store = MemoryStore::new();
        let index = MerkleIndex::new(&store);
        assert_eq!(index.entries().count(), 0);
    }

    #[test]
    fn test_page_boundary_exact_multiple() {
        let store = MemoryStore::new();
        seed(&store, 6);

        // 6 rows over pages of 3: the second page is full, a third returns
        // nothing and terminates the scan.
        let index = MerkleIndex::with_page_size(&store, 3);
        assert_eq!(index.entries().count(), 6);
    }

    #[test]
    fn test_rebuild_tree_matches_incremental_inserts() {
        let store = MemoryStore::new();
        seed(&store, 25);

        let incremental = MemoryTree::new();
        for entry in MerkleIndex::new(&store).entries() {
            let (id, hash) = entry.unwrap();
            incremental.insert(id.as_bytes(), hash).unwrap();
        }

        let rebuilt = MemoryTree::new();
        rebuild_tree(&store, &rebuilt).unwrap();

        use crate::tree::TreeStore;
        assert_eq!(rebuilt.root().unwrap(), incremental.root().unwrap());
    }
}
