//! The per-topic append log
//!
//! Orchestrates validation, the mempool, the Merkle tree, and the durable
//! store. All mutations are serialized through one mutex per log instance, so
//! heads and the tree root are always observed in a consistent snapshot;
//! reads go straight to the store.

use crate::events::LogEvent;
use crate::mempool::Mempool;
use crate::merkle_index;
use crate::store::{IdRange, MessageStore, StoreError};
use crate::tree::{Node, TreeStore};
use gossiplog_core::{
    clock_from_parents, sha256, KeyPair, Message, MessageId, MessageSet, Signature,
    SignaturePolicy, SignedMessage,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const META_HEADS: &str = "heads";
const META_SCHEMA: &str = "schema_version";

const PAGE_SIZE: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Log errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("validation failed: {0}")]
    Validation(#[from] gossiplog_core::Error),
    #[error("payload rejected: {0}")]
    Rejected(#[from] ApplyError),
    #[error("wrong topic: expected {expected}, got {actual}")]
    TopicMismatch { expected: String, actual: String },
    #[error("log is not ready (state: {0:?})")]
    NotReady(LogState),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Rejection reason returned by an application's `apply` callback.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

/// Application side-effect hook, invoked once per durably applied message.
pub trait Apply<P>: Send + Sync {
    fn apply(
        &self,
        id: &MessageId,
        signature: Option<&Signature>,
        message: &Message<P>,
    ) -> Result<(), ApplyError>;
}

impl<P, F> Apply<P> for F
where
    F: Fn(&MessageId, Option<&Signature>, &Message<P>) -> Result<(), ApplyError> + Send + Sync,
{
    fn apply(
        &self,
        id: &MessageId,
        signature: Option<&Signature>,
        message: &Message<P>,
    ) -> Result<(), ApplyError> {
        self(id, signature, message)
    }
}

/// Accept-everything apply hook.
pub struct NoopApply;

impl<P> Apply<P> for NoopApply {
    fn apply(
        &self,
        _id: &MessageId,
        _signature: Option<&Signature>,
        _message: &Message<P>,
    ) -> Result<(), ApplyError> {
        Ok(())
    }
}

/// One-shot schema migration, applied at open before the log reaches ready.
pub struct Migration {
    pub version: u32,
    pub run: Box<dyn Fn(&dyn MessageStore) -> Result<(), StoreError> + Send + Sync>,
}

/// Log lifecycle states. `Ready` is the only state accepting writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogState {
    Opening,
    Ready,
    Closing,
    Closed,
}

/// Per-topic log configuration.
pub struct LogConfig<P> {
    pub topic: String,
    pub policy: SignaturePolicy,
    pub keypair: Option<KeyPair>,
    pub schema_version: u32,
    pub migrations: Vec<Migration>,
    pub apply: Box<dyn Apply<P>>,
}

impl<P> LogConfig<P> {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            policy: SignaturePolicy::Required,
            keypair: None,
            schema_version: 1,
            migrations: Vec::new(),
            apply: Box::new(NoopApply),
        }
    }

    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_apply(mut self, apply: impl Apply<P> + 'static) -> Self {
        self.apply = Box::new(apply);
        self
    }

    pub fn with_schema(mut self, version: u32, migrations: Vec<Migration>) -> Self {
        self.schema_version = version;
        self.migrations = migrations;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.topic.is_empty() {
            anyhow::bail!("topic cannot be empty");
        }
        if self.schema_version == 0 {
            anyhow::bail!("schema version must be at least 1");
        }
        let mut versions: Vec<u32> = self.migrations.iter().map(|m| m.version).collect();
        versions.sort_unstable();
        versions.dedup();
        if versions.len() != self.migrations.len() {
            anyhow::bail!("duplicate migration versions");
        }
        Ok(())
    }
}

/// Result of a local append.
pub struct AppendResult<P> {
    pub id: MessageId,
    pub signed: SignedMessage<P>,
}

/// Result of inserting a remote envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Applied immediately (all parents present).
    Applied(MessageId),
    /// Buffered in the mempool until its parents arrive.
    Deferred(MessageId),
    /// Already stored; insert is idempotent.
    Exists(MessageId),
}

impl InsertOutcome {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Applied(id) | Self::Deferred(id) | Self::Exists(id) => *id,
        }
    }
}

struct LogInner<P> {
    state: LogState,
    heads: MessageSet,
    mempool: Mempool<SignedMessage<P>>,
}

/// A per-topic, content-addressed, causally-ordered append log.
pub struct GossipLog<P, S, T>
where
    S: MessageStore,
    T: TreeStore,
{
    topic: String,
    policy: SignaturePolicy,
    keypair: Option<KeyPair>,
    apply: Box<dyn Apply<P>>,
    store: S,
    tree: T,
    inner: Mutex<LogInner<P>>,
    events: broadcast::Sender<LogEvent<P>>,
}

impl<P, S, T> GossipLog<P, S, T>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: MessageStore,
    T: TreeStore,
{
    /// Open a log over the given store and tree.
    ///
    /// Runs pending schema migrations, loads (or recovers) the heads, and
    /// rebuilds the tree when it is empty but the store is not, before the
    /// log reaches ready.
    pub fn open(config: LogConfig<P>, store: S, tree: T) -> Result<Self, LogError> {
        config
            .validate()
            .map_err(|e| LogError::Config(e.to_string()))?;

        let LogConfig {
            topic,
            policy,
            keypair,
            schema_version,
            migrations,
            apply,
        } = config;

        info!(topic = %topic, "opening log");
        let migrated = run_migrations(&store, schema_version, &migrations)?;

        let heads = match store.meta(META_HEADS)? {
            Some(bytes) => MessageSet::decode(&bytes)?,
            None => recompute_heads::<P, S>(&store)?,
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let log = Self {
            topic,
            policy,
            keypair,
            apply,
            store,
            tree,
            inner: Mutex::new(LogInner {
                state: LogState::Opening,
                heads,
                mempool: Mempool::new(),
            }),
            events,
        };

        if migrated {
            log.replay_locked()?;
        } else if log.tree.root()?.level == 0 && !log.store.is_empty()? {
            merkle_index::rebuild_tree(&log.store, &log.tree)?;
        }

        log.inner.lock().state = LogState::Ready;
        info!(topic = %log.topic, messages = log.store.len()?, "log ready");
        Ok(log)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    pub fn state(&self) -> LogState {
        self.inner.lock().state
    }

    /// Current causal frontier.
    pub fn heads(&self) -> MessageSet {
        self.inner.lock().heads.clone()
    }

    /// Number of messages buffered awaiting parents.
    pub fn mempool_len(&self) -> usize {
        self.inner.lock().mempool.len()
    }

    /// Current tree root.
    pub fn root(&self) -> Result<Node, LogError> {
        Ok(self.tree.root()?)
    }

    pub fn len(&self) -> Result<usize, LogError> {
        Ok(self.store.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, LogError> {
        Ok(self.store.is_empty()?)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent<P>> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: LogEvent<P>) {
        // Best-effort: an error only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Append a new local message on top of the current heads.
    pub fn append(&self, payload: P) -> Result<AppendResult<P>, LogError> {
        let mut inner = self.inner.lock();
        ensure_ready(&inner)?;

        let parents = inner.heads.to_vec();
        let clock = match self.policy {
            SignaturePolicy::Required => clock_from_parents(&parents),
            SignaturePolicy::Disabled => 0,
        };
        let message = Message {
            topic: self.topic.clone(),
            clock,
            parents,
            payload,
        };
        let signature = match self.policy {
            SignaturePolicy::Required => {
                let keypair = self.keypair.as_ref().ok_or_else(|| {
                    LogError::Config("append on a signed topic requires a keypair".into())
                })?;
                Some(keypair.sign(&message)?)
            }
            SignaturePolicy::Disabled => None,
        };

        let signed = SignedMessage { signature, message };
        let id = signed.id()?;
        self.commit(&mut inner, id, &signed, false)?;
        debug!(topic = %self.topic, %id, clock, "appended message");
        Ok(AppendResult { id, signed })
    }

    /// Insert a remote envelope received via gossip or sync.
    ///
    /// Structural validation failures are rejected outright; a missing parent
    /// is not an error, the message is buffered until its ancestors resolve.
    pub fn insert(&self, bytes: &[u8]) -> Result<InsertOutcome, LogError> {
        let signed: SignedMessage<P> = SignedMessage::decode(bytes)?;
        if signed.message.topic != self.topic {
            return Err(LogError::TopicMismatch {
                expected: self.topic.clone(),
                actual: signed.message.topic,
            });
        }
        signed.validate(self.policy)?;
        let id = signed.id()?;

        let mut inner = self.inner.lock();
        ensure_ready(&inner)?;

        if self.store.contains(&id)? {
            return Ok(InsertOutcome::Exists(id));
        }

        let mut missing = HashSet::new();
        for parent in &signed.message.parents {
            if !self.store.contains(parent)? {
                missing.insert(*parent);
            }
        }

        if !missing.is_empty() {
            debug!(topic = %self.topic, %id, missing = missing.len(), "deferring message");
            inner.mempool.add(id, signed, missing);
            return Ok(InsertOutcome::Deferred(id));
        }

        self.commit(&mut inner, id, &signed, false)?;
        self.release_descendants(&mut inner, id)?;
        Ok(InsertOutcome::Applied(id))
    }

    /// Fetch a stored envelope.
    pub fn get(&self, id: &MessageId) -> Result<Option<SignedMessage<P>>, LogError> {
        match self.store.get(id)? {
            Some(bytes) => Ok(Some(SignedMessage::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ordered, restartable iteration over stored messages.
    pub fn iterate(&self, range: IdRange) -> MessageIter<'_, P, S> {
        MessageIter {
            store: &self.store,
            range,
            page: VecDeque::new(),
            exhausted: false,
            _payload: PhantomData,
        }
    }

    /// Re-derive the tree and re-invoke `apply` for every stored message in
    /// ascending id order. Idempotent; publishes a single commit for the
    /// final root instead of per-message events.
    pub fn replay(&self) -> Result<usize, LogError> {
        ensure_ready(&self.inner.lock())?;
        let count = self.replay_locked()?;
        let root = self.tree.root()?;
        self.publish(LogEvent::Commit { root: root.hash });
        Ok(count)
    }

    /// Flush and close the log. Further writes are rejected.
    pub fn close(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.state = LogState::Closing;
        self.store.flush()?;
        inner.state = LogState::Closed;
        info!(topic = %self.topic, "log closed");
        Ok(())
    }

    /// Apply one message: side effects, durable write, tree insert, heads.
    fn commit(
        &self,
        inner: &mut LogInner<P>,
        id: MessageId,
        signed: &SignedMessage<P>,
        replay: bool,
    ) -> Result<(), LogError> {
        self.apply
            .apply(&id, signed.signature.as_ref(), &signed.message)?;

        let value = signed.encode()?;
        self.store.put(&id, &value)?;
        self.tree.insert(id.as_bytes(), sha256(&value))?;

        for parent in &signed.message.parents {
            inner.heads.remove(parent);
        }
        inner.heads.insert(id);
        self.store.set_meta(META_HEADS, &inner.heads.encode()?)?;

        if !replay {
            let root = self.tree.root()?;
            self.publish(LogEvent::Message {
                id,
                signature: signed.signature.clone(),
                message: signed.message.clone(),
            });
            self.publish(LogEvent::Commit { root: root.hash });
        }
        Ok(())
    }

    /// Cascade mempool releases after `id` became durably present.
    fn release_descendants(
        &self,
        inner: &mut LogInner<P>,
        id: MessageId,
    ) -> Result<(), LogError> {
        let mut worklist = vec![id];
        while let Some(next) = worklist.pop() {
            let released = inner.mempool.observe(&next);
            for (child, signed) in released {
                match self.commit(inner, child, &signed, false) {
                    Ok(()) => worklist.push(child),
                    Err(LogError::Rejected(reason)) => {
                        warn!(topic = %self.topic, id = %child, %reason, "dropping rejected message");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn replay_locked(&self) -> Result<usize, LogError> {
        let mut inner = self.inner.lock();

        let mut count = 0;
        let mut last: Option<MessageId> = None;
        loop {
            let range = match last {
                Some(last) => IdRange::all().gt(last),
                None => IdRange::all(),
            };
            let rows = self.store.scan(&range, PAGE_SIZE)?;
            let page_len = rows.len();
            for (id, value) in rows {
                let signed: SignedMessage<P> = SignedMessage::decode(&value)?;
                if let Err(reason) =
                    self.apply
                        .apply(&id, signed.signature.as_ref(), &signed.message)
                {
                    warn!(topic = %self.topic, %id, %reason, "apply rejected during replay");
                }
                count += 1;
                last = Some(id);
            }
            if page_len < PAGE_SIZE {
                break;
            }
        }

        inner.heads = recompute_heads::<P, S>(&self.store)?;
        self.store.set_meta(META_HEADS, &inner.heads.encode()?)?;
        merkle_index::rebuild_tree(&self.store, &self.tree)?;
        info!(topic = %self.topic, count, "replay complete");
        Ok(count)
    }
}

fn ensure_ready<P>(inner: &LogInner<P>) -> Result<(), LogError> {
    match inner.state {
        LogState::Ready => Ok(()),
        state => Err(LogError::NotReady(state)),
    }
}

fn run_migrations<S: MessageStore>(
    store: &S,
    target: u32,
    migrations: &[Migration],
) -> Result<bool, LogError> {
    let stored = match store.meta(META_SCHEMA)? {
        Some(bytes) => {
            let bytes: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt("bad schema version record".into()))?;
            Some(u32::from_le_bytes(bytes))
        }
        None => None,
    };

    match stored {
        None => {
            store.set_meta(META_SCHEMA, &target.to_le_bytes())?;
            Ok(false)
        }
        Some(version) if version == target => Ok(false),
        Some(version) if version > target => Err(LogError::Config(format!(
            "store schema {version} is newer than configured {target}"
        ))),
        Some(version) => {
            let mut pending: Vec<&Migration> = migrations
                .iter()
                .filter(|m| m.version > version && m.version <= target)
                .collect();
            pending.sort_by_key(|m| m.version);
            for migration in pending {
                info!(from = version, to = migration.version, "running migration");
                (migration.run)(store)?;
            }
            store.set_meta(META_SCHEMA, &target.to_le_bytes())?;
            Ok(true)
        }
    }
}

/// Heads are the stored ids that no stored message references as a parent.
fn recompute_heads<P, S>(store: &S) -> Result<MessageSet, LogError>
where
    P: Serialize + DeserializeOwned,
    S: MessageStore,
{
    let mut heads = MessageSet::new();
    let mut referenced: HashSet<MessageId> = HashSet::new();
    let mut last: Option<MessageId> = None;
    loop {
        let range = match last {
            Some(last) => IdRange::all().gt(last),
            None => IdRange::all(),
        };
        let rows = store.scan(&range, PAGE_SIZE)?;
        let page_len = rows.len();
        for (id, value) in rows {
            let signed: SignedMessage<P> = SignedMessage::decode(&value)?;
            heads.insert(id);
            referenced.extend(signed.message.parents.iter().copied());
            last = Some(id);
        }
        if page_len < PAGE_SIZE {
            break;
        }
    }
    for id in &referenced {
        heads.remove(id);
    }
    Ok(heads)
}

/// Paginated iterator over stored envelopes.
pub struct MessageIter<'a, P, S: MessageStore> {
    store: &'a S,
    range: IdRange,
    page: VecDeque<(MessageId, Vec<u8>)>,
    exhausted: bool,
    _payload: PhantomData<P>,
}

impl<'a, P: DeserializeOwned, S: MessageStore> Iterator for MessageIter<'a, P, S> {
    type Item = Result<(MessageId, SignedMessage<P>), LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            let rows = match self.store.scan(&self.range, PAGE_SIZE) {
                Ok(rows) => rows,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            };
            if rows.len() < PAGE_SIZE {
                self.exhausted = true;
            }
            if let Some((id, _)) = rows.last() {
                self.range = self.range.gt(*id);
            }
            self.page.extend(rows);
        }

        let (id, bytes) = self.page.pop_front()?;
        Some(
            SignedMessage::decode(&bytes)
                .map(|signed| (id, signed))
                .map_err(LogError::from),
        )
    }
}
