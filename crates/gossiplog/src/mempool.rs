//! Buffer for messages whose causal parents have not yet arrived
//!
//! Missing parents are the expected, common case under gossip delivery, not
//! an error. A buffered message is released exactly when its last missing
//! parent is observed; callers then re-observe each released id, since one
//! release may cascade-unblock others.

use gossiplog_core::MessageId;
use std::collections::{HashMap, HashSet};

struct BlockedEntry<T> {
    value: T,
    missing: HashSet<MessageId>,
}

/// Pending messages keyed by id, with a reverse index from each awaited
/// parent to the children waiting on it.
pub struct Mempool<T> {
    blocked: HashMap<MessageId, BlockedEntry<T>>,
    waiting: HashMap<MessageId, HashSet<MessageId>>,
}

impl<T> Default for Mempool<T> {
    fn default() -> Self {
        Self {
            blocked: HashMap::new(),
            waiting: HashMap::new(),
        }
    }
}

impl<T> Mempool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.blocked.contains_key(id)
    }

    /// Buffer a message until every id in `missing` has been observed.
    ///
    /// The mempool is strictly for blocked messages: callers apply messages
    /// with no missing parents directly.
    pub fn add(&mut self, id: MessageId, value: T, missing: HashSet<MessageId>) {
        assert!(
            !missing.is_empty(),
            "mempool entries must have at least one missing parent"
        );
        for parent in &missing {
            self.waiting.entry(*parent).or_default().insert(id);
        }
        self.blocked.insert(id, BlockedEntry { value, missing });
    }

    /// Record that `id` is now durably present, releasing any children whose
    /// missing-parent set becomes empty. Safe to call for ids nothing waits
    /// on. Callers must `observe` each released id in turn.
    pub fn observe(&mut self, id: &MessageId) -> Vec<(MessageId, T)> {
        let Some(children) = self.waiting.remove(id) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for child in children {
            let entry = self
                .blocked
                .get_mut(&child)
                .expect("waiting index refers to a buffered entry");
            entry.missing.remove(id);
            if entry.missing.is_empty() {
                let entry = self
                    .blocked
                    .remove(&child)
                    .expect("entry present under the single-writer lock");
                released.push((child, entry.value));
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(clock: u64, seed: u8) -> MessageId {
        MessageId::encode(clock, &[seed; 32])
    }

    #[test]
    fn test_released_only_after_all_parents() {
        let mut pool = Mempool::new();
        let (p1, p2, child) = (id(1, 1), id(1, 2), id(2, 3));

        pool.add(child, "v", [p1, p2].into_iter().collect());
        assert_eq!(pool.len(), 1);

        assert!(pool.observe(&p1).is_empty());
        assert!(pool.contains(&child));

        let released = pool.observe(&p2);
        assert_eq!(released, vec![(child, "v")]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_order_independent() {
        let mut pool = Mempool::new();
        let (p1, p2, child) = (id(1, 1), id(1, 2), id(2, 3));

        pool.add(child, "v", [p1, p2].into_iter().collect());
        assert!(pool.observe(&p2).is_empty());
        assert_eq!(pool.observe(&p1), vec![(child, "v")]);
    }

    #[test]
    fn test_observe_unknown_id_is_empty() {
        let mut pool: Mempool<&str> = Mempool::new();
        assert!(pool.observe(&id(1, 1)).is_empty());
    }

    #[test]
    fn test_released_exactly_once() {
        let mut pool = Mempool::new();
        let (p, child) = (id(1, 1), id(2, 2));

        pool.add(child, "v", [p].into_iter().collect());
        assert_eq!(pool.observe(&p).len(), 1);
        assert!(pool.observe(&p).is_empty());
    }

    #[test]
    fn test_shared_parent_releases_both_children() {
        let mut pool = Mempool::new();
        let (p, c1, c2) = (id(1, 1), id(2, 2), id(2, 3));

        pool.add(c1, "a", [p].into_iter().collect());
        pool.add(c2, "b", [p].into_iter().collect());

        let mut released = pool.observe(&p);
        released.sort_by_key(|(id, _)| *id);
        assert_eq!(released, vec![(c1, "a"), (c2, "b")]);
    }

    #[test]
    fn test_cascading_release() {
        // c2 waits on c1, c1 waits on p: observing p releases c1, and
        // observing c1 (as the caller must) releases c2.
        let mut pool = Mempool::new();
        let (p, c1, c2) = (id(1, 1), id(2, 2), id(3, 3));

        pool.add(c1, "first", [p].into_iter().collect());
        pool.add(c2, "second", [c1].into_iter().collect());

        let released = pool.observe(&p);
        assert_eq!(released, vec![(c1, "first")]);

        let released = pool.observe(&c1);
        assert_eq!(released, vec![(c2, "second")]);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic(expected = "at least one missing parent")]
    fn test_add_with_no_missing_parents_panics() {
        let mut pool = Mempool::new();
        pool.add(id(1, 1), "v", HashSet::new());
    }
}
