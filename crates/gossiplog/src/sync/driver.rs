//! Sync initiator: recursive tree diff as an explicit worklist
//!
//! Produces the `(id, value)` pairs the local replica is missing relative to
//! the source's tree, descending only where hashes differ. Pull-based: each
//! `next_missing` call advances the traversal just far enough to yield the
//! next entry, so the full missing set is never materialized.

use super::{SyncError, SyncSource};
use crate::tree::{Node, TreeStore};
use gossiplog_core::MessageId;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

enum Task {
    /// Source subtree sits above the target root's level; keep descending.
    Descend { target_level: u32, node: Node },
    /// Compare against the target node at the same `(level, key)`.
    Visit(Node),
}

enum State {
    NotStarted,
    Running,
    Done,
}

/// Sync session initiator.
pub struct Driver<'a, Src: SyncSource, T: TreeStore + ?Sized> {
    source: &'a mut Src,
    target: &'a T,
    stack: Vec<Task>,
    ready: VecDeque<(MessageId, Vec<u8>)>,
    state: State,
}

impl<'a, Src: SyncSource, T: TreeStore + ?Sized> Driver<'a, Src, T> {
    pub fn new(source: &'a mut Src, target: &'a T) -> Self {
        Self {
            source,
            target,
            stack: Vec::new(),
            ready: VecDeque::new(),
            state: State::NotStarted,
        }
    }

    /// The next missing entry, or `None` once the diff is exhausted.
    pub async fn next_missing(&mut self) -> Result<Option<(MessageId, Vec<u8>)>, SyncError> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Ok(Some(entry));
            }
            match self.state {
                State::Done => return Ok(None),
                State::NotStarted => {
                    self.state = State::Running;
                    let source_root = self.source.get_root().await?;
                    if source_root.level == 0 {
                        // empty source tree
                        self.state = State::Done;
                        return Ok(None);
                    }
                    let target_root = self.target.root()?;
                    if source_root == target_root {
                        debug!("roots equal, already in sync");
                        self.state = State::Done;
                        return Ok(None);
                    }
                    self.stack.push(Task::Descend {
                        target_level: target_root.level,
                        node: source_root,
                    });
                }
                State::Running => {
                    let Some(task) = self.stack.pop() else {
                        self.state = State::Done;
                        return Ok(None);
                    };
                    match task {
                        Task::Descend { target_level, node } => {
                            self.descend(target_level, node).await?
                        }
                        Task::Visit(node) => self.visit(node).await?,
                    }
                }
            }
        }
    }

    /// Drain the remaining missing entries.
    pub async fn collect_missing(&mut self) -> Result<Vec<(MessageId, Vec<u8>)>, SyncError> {
        let mut out = Vec::new();
        while let Some(entry) = self.next_missing().await? {
            out.push(entry);
        }
        Ok(out)
    }

    async fn descend(&mut self, target_level: u32, node: Node) -> Result<(), SyncError> {
        if node.level <= target_level {
            self.stack.push(Task::Visit(node));
            return Ok(());
        }
        let Some(children) = self
            .source
            .get_children(node.level, node.key.as_deref())
            .await?
        else {
            return Ok(());
        };

        if target_level == 0 && node.level == 1 {
            // The target has nothing at or below this branch.
            let keys = leaf_keys(&children)?;
            self.fetch_values(keys).await?;
        } else {
            for child in children.into_iter().rev() {
                self.stack.push(Task::Descend { target_level, node: child });
            }
        }
        Ok(())
    }

    async fn visit(&mut self, node: Node) -> Result<(), SyncError> {
        if let Some(local) = self.target.node(node.level, node.key.as_deref())? {
            if local.hash == node.hash {
                // identical subtrees
                return Ok(());
            }
        }

        let Some(children) = self
            .source
            .get_children(node.level, node.key.as_deref())
            .await?
        else {
            return Ok(());
        };

        if node.level > 1 {
            for child in children.into_iter().rev() {
                self.stack.push(Task::Visit(child));
            }
            return Ok(());
        }

        // children are leaves
        let mut missing = Vec::new();
        for leaf in &children {
            let Some(key) = &leaf.key else { continue };
            match self.target.node(0, Some(key.as_slice()))? {
                None => missing.push(parse_key(key)?),
                Some(local) if local.hash == leaf.hash => {}
                Some(local) => {
                    // Content-addressed keys must be hash-stable; never
                    // overwrite the local leaf, never abort the session.
                    error!(
                        key = %hex::encode(key),
                        local = %hex::encode(local.hash),
                        remote = %hex::encode(leaf.hash),
                        "leaf hash conflict, skipping entry"
                    );
                }
            }
        }
        self.fetch_values(missing).await
    }

    async fn fetch_values(&mut self, keys: Vec<MessageId>) -> Result<(), SyncError> {
        if keys.is_empty() {
            return Ok(());
        }
        let values = self.source.get_values(&keys).await?;
        if values.len() != keys.len() {
            return Err(SyncError::Protocol(format!(
                "expected {} values, got {}",
                keys.len(),
                values.len()
            )));
        }
        for (key, value) in keys.into_iter().zip(values) {
            match value {
                Some(value) => self.ready.push_back((key, value)),
                None => warn!(id = %key, "responder had no value for advertised leaf"),
            }
        }
        Ok(())
    }
}

fn leaf_keys(children: &[Node]) -> Result<Vec<MessageId>, SyncError> {
    children
        .iter()
        .filter_map(|node| node.key.as_deref())
        .map(parse_key)
        .collect()
}

fn parse_key(key: &[u8]) -> Result<MessageId, SyncError> {
    MessageId::from_bytes(key).map_err(|e| SyncError::Protocol(format!("bad leaf key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MessageStore};
    use crate::sync::LocalSource;
    use crate::tree::MemoryTree;
    use gossiplog_core::sha256;

    fn seed(store: &MemoryStore, tree: &MemoryTree, clocks: impl Iterator<Item = u64>) {
        for i in clocks {
            let value = i.to_be_bytes().to_vec();
            let id = MessageId::encode(i, &sha256(&value));
            store.put(&id, &value).unwrap();
            tree.insert(id.as_bytes(), sha256(&value)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_source_yields_nothing() {
        let (source_store, source_tree) = (MemoryStore::new(), MemoryTree::new());
        let target_tree = MemoryTree::new();

        let mut source = LocalSource::new(&source_tree, &source_store);
        let mut driver = Driver::new(&mut source, &target_tree);
        assert!(driver.collect_missing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_equal_trees_short_circuit() {
        let (source_store, source_tree) = (MemoryStore::new(), MemoryTree::new());
        let (target_store, target_tree) = (MemoryStore::new(), MemoryTree::new());
        seed(&source_store, &source_tree, 1..=20);
        seed(&target_store, &target_tree, 1..=20);

        let mut source = LocalSource::new(&source_tree, &source_store);
        let mut driver = Driver::new(&mut source, &target_tree);
        assert!(driver.collect_missing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_transfer_into_empty_target() {
        let (source_store, source_tree) = (MemoryStore::new(), MemoryTree::new());
        seed(&source_store, &source_tree, 1..=100);
        let target_tree = MemoryTree::new();

        let mut source = LocalSource::new(&source_tree, &source_store);
        let mut driver = Driver::new(&mut source, &target_tree);
        let missing = driver.collect_missing().await.unwrap();

        assert_eq!(missing.len(), 100);
        for (id, value) in &missing {
            assert_eq!(source_store.get(id).unwrap().as_deref(), Some(value.as_slice()));
        }
    }

    #[tokio::test]
    async fn test_partial_overlap_transfers_difference() {
        let (source_store, source_tree) = (MemoryStore::new(), MemoryTree::new());
        let (target_store, target_tree) = (MemoryStore::new(), MemoryTree::new());
        seed(&source_store, &source_tree, 1..=60);
        seed(&target_store, &target_tree, 1..=40);

        let mut source = LocalSource::new(&source_tree, &source_store);
        let mut driver = Driver::new(&mut source, &target_tree);
        let missing = driver.collect_missing().await.unwrap();

        let mut clocks: Vec<u64> = missing.iter().map(|(id, _)| id.clock()).collect();
        clocks.sort_unstable();
        assert_eq!(clocks, (41..=60).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_leaf_conflict_is_skipped_not_transferred() {
        let (source_store, source_tree) = (MemoryStore::new(), MemoryTree::new());
        let (_, target_tree) = (MemoryStore::new(), MemoryTree::new());

        // Same key on both sides with different hashes.
        let value = b"original".to_vec();
        let id = MessageId::encode(1, &sha256(&value));
        source_store.put(&id, &value).unwrap();
        source_tree.insert(id.as_bytes(), sha256(&value)).unwrap();
        target_tree.insert(id.as_bytes(), sha256(b"divergent")).unwrap();

        let mut source = LocalSource::new(&source_tree, &source_store);
        let mut driver = Driver::new(&mut source, &target_tree);
        let missing = driver.collect_missing().await.unwrap();
        assert!(missing.is_empty());

        // The local leaf is untouched.
        let local = target_tree.node(0, Some(id.as_bytes().as_slice())).unwrap().unwrap();
        assert_eq!(local.hash, sha256(b"divergent"));
    }
}
