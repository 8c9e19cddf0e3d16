//! Merkle Search Tree over the message key space
//!
//! The tree is a deterministic function of its leaf set: leaves are the
//! `(message id, value hash)` pairs in key order, and group boundaries at
//! every level are derived from node hashes, so two replicas holding the same
//! messages always converge on the same root. Each level starts with an
//! anchor node (`key == None`); the root is the single node of the highest
//! level, and an empty tree's root is the level-0 anchor.

use crate::store::StoreError;
use gossiplog_core::MessageId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Average branching factor target.
const FANOUT: u32 = 32;

/// A node whose leading hash word falls below this limit starts a new group.
const BOUNDARY_LIMIT: u32 = u32::MAX / FANOUT;

/// A tree node. `key == None` only on the anchor chain (including the root).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub level: u32,
    pub key: Option<Vec<u8>>,
    pub hash: [u8; 32],
}

impl Node {
    fn is_boundary(&self) -> bool {
        let word = u32::from_be_bytes([self.hash[0], self.hash[1], self.hash[2], self.hash[3]]);
        word < BOUNDARY_LIMIT
    }
}

/// Textual node identifier: `hex(level)[":" hex(key)]`, key omitted for the
/// anchor chain.
pub fn node_id(level: u32, key: Option<&[u8]>) -> String {
    match key {
        Some(key) => format!("{:x}:{}", level, hex::encode(key)),
        None => format!("{:x}", level),
    }
}

fn anchor_hash() -> [u8; 32] {
    Sha256::new().finalize().into()
}

/// A parent's hash is a pure function of its children's `(key, hash)` pairs.
fn parent_hash(children: &[Node]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for child in children {
        match &child.key {
            Some(key) => {
                hasher.update([key.len() as u8]);
                hasher.update(key);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(child.hash);
    }
    hasher.finalize().into()
}

/// Node-level view of the tree, sufficient for the sync driver and server.
pub trait TreeStore: Send + Sync {
    /// The current root. An empty tree's root is the level-0 anchor.
    fn root(&self) -> Result<Node, StoreError>;

    /// Look up a node by `(level, key)`.
    fn node(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Node>, StoreError>;

    /// Children of a node, in key order. `None` if the node does not exist;
    /// an existing leaf has no children.
    fn children(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Vec<Node>>, StoreError>;

    /// Insert or update a leaf.
    fn insert(&self, key: &[u8], hash: [u8; 32]) -> Result<(), StoreError>;

    /// Replace the leaf set from a `(message id, value hash)` stream.
    fn rebuild(
        &self,
        entries: &mut dyn Iterator<Item = Result<(MessageId, [u8; 32]), StoreError>>,
    ) -> Result<(), StoreError>;
}

/// Built level structure, cached between mutations.
struct Levels {
    /// `levels[0]` is the anchor followed by the leaves; the last level has
    /// exactly one node, the root.
    levels: Vec<Vec<Node>>,
    /// `spans[l][i]` is the child range at level `l - 1` covered by node `i`
    /// of level `l`.
    spans: Vec<Vec<(usize, usize)>>,
    /// node id -> (level, position)
    index: HashMap<String, (u32, usize)>,
}

impl Levels {
    fn build(leaves: impl Iterator<Item = (Vec<u8>, [u8; 32])>) -> Self {
        let mut level0 = vec![Node {
            level: 0,
            key: None,
            hash: anchor_hash(),
        }];
        level0.extend(leaves.map(|(key, hash)| Node {
            level: 0,
            key: Some(key),
            hash,
        }));

        let mut levels = vec![level0];
        let mut spans: Vec<Vec<(usize, usize)>> = vec![Vec::new()];

        while levels.last().map(Vec::len) > Some(1) {
            let children = levels.last().cloned().unwrap_or_default();
            let level = children[0].level + 1;

            let mut parents = Vec::new();
            let mut parent_spans = Vec::new();
            let mut start = 0;
            for end in 1..=children.len() {
                if end == children.len() || children[end].is_boundary() {
                    let group = &children[start..end];
                    parents.push(Node {
                        level,
                        key: group[0].key.clone(),
                        hash: parent_hash(group),
                    });
                    parent_spans.push((start, end));
                    start = end;
                }
            }

            levels.push(parents);
            spans.push(parent_spans);
        }

        let mut index = HashMap::new();
        for nodes in &levels {
            for (pos, node) in nodes.iter().enumerate() {
                index.insert(node_id(node.level, node.key.as_deref()), (node.level, pos));
            }
        }

        Self { levels, spans, index }
    }

    fn root(&self) -> Node {
        // The top level always holds exactly one node.
        self.levels[self.levels.len() - 1][0].clone()
    }

    fn node(&self, level: u32, key: Option<&[u8]>) -> Option<Node> {
        let &(l, pos) = self.index.get(&node_id(level, key))?;
        Some(self.levels[l as usize][pos].clone())
    }

    fn children(&self, level: u32, key: Option<&[u8]>) -> Option<Vec<Node>> {
        let &(l, pos) = self.index.get(&node_id(level, key))?;
        if l == 0 {
            return Some(Vec::new());
        }
        let (start, end) = self.spans[l as usize][pos];
        Some(self.levels[l as usize - 1][start..end].to_vec())
    }
}

/// In-memory tree.
#[derive(Default)]
pub struct MemoryTree {
    leaves: RwLock<BTreeMap<Vec<u8>, [u8; 32]>>,
    cache: RwLock<Option<Arc<Levels>>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn levels(&self) -> Arc<Levels> {
        if let Some(levels) = self.cache.read().as_ref() {
            return levels.clone();
        }
        let leaves = self.leaves.read();
        let built = Arc::new(Levels::build(
            leaves.iter().map(|(k, h)| (k.clone(), *h)),
        ));
        *self.cache.write() = Some(built.clone());
        built
    }
}

impl TreeStore for MemoryTree {
    fn root(&self) -> Result<Node, StoreError> {
        Ok(self.levels().root())
    }

    fn node(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Node>, StoreError> {
        Ok(self.levels().node(level, key))
    }

    fn children(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Vec<Node>>, StoreError> {
        Ok(self.levels().children(level, key))
    }

    fn insert(&self, key: &[u8], hash: [u8; 32]) -> Result<(), StoreError> {
        self.leaves.write().insert(key.to_vec(), hash);
        *self.cache.write() = None;
        Ok(())
    }

    fn rebuild(
        &self,
        entries: &mut dyn Iterator<Item = Result<(MessageId, [u8; 32]), StoreError>>,
    ) -> Result<(), StoreError> {
        let mut leaves = BTreeMap::new();
        for entry in entries {
            let (id, hash) = entry?;
            leaves.insert(id.as_bytes().to_vec(), hash);
        }
        *self.leaves.write() = leaves;
        *self.cache.write() = None;
        Ok(())
    }
}

/// Persistent tree: leaves live in a sled tree, the level structure is
/// rebuilt lazily in memory from them (and on cold start via the merkle
/// index cursor).
pub struct SledTree {
    leaves: sled::Tree,
    cache: RwLock<Option<Arc<Levels>>>,
}

impl SledTree {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(&db)
    }

    /// Open the tree inside an existing sled database.
    pub fn with_db(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            leaves: db.open_tree("tree_leaves")?,
            cache: RwLock::new(None),
        })
    }

    fn levels(&self) -> Result<Arc<Levels>, StoreError> {
        if let Some(levels) = self.cache.read().as_ref() {
            return Ok(levels.clone());
        }
        let mut leaves = Vec::new();
        for entry in self.leaves.iter() {
            let (key, value) = entry?;
            let hash: [u8; 32] = value
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Corrupt("bad leaf hash length".into()))?;
            leaves.push((key.to_vec(), hash));
        }
        let built = Arc::new(Levels::build(leaves.into_iter()));
        *self.cache.write() = Some(built.clone());
        Ok(built)
    }
}

impl TreeStore for SledTree {
    fn root(&self) -> Result<Node, StoreError> {
        Ok(self.levels()?.root())
    }

    fn node(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Node>, StoreError> {
        Ok(self.levels()?.node(level, key))
    }

    fn children(&self, level: u32, key: Option<&[u8]>) -> Result<Option<Vec<Node>>, StoreError> {
        Ok(self.levels()?.children(level, key))
    }

    fn insert(&self, key: &[u8], hash: [u8; 32]) -> Result<(), StoreError> {
        self.leaves.insert(key, &hash)?;
        *self.cache.write() = None;
        Ok(())
    }

    fn rebuild(
        &self,
        entries: &mut dyn Iterator<Item = Result<(MessageId, [u8; 32]), StoreError>>,
    ) -> Result<(), StoreError> {
        self.leaves.clear()?;
        for entry in entries {
            let (id, hash) = entry?;
            self.leaves.insert(id.as_bytes(), &hash)?;
        }
        *self.cache.write() = None;
        Ok(())
    }
}
