//! Log lifecycle events
//!
//! Delivered over a broadcast channel: sends never block the writer, and a
//! lagging subscriber loses old events rather than stalling the log.

use gossiplog_core::{Message, MessageId, Signature};
use std::time::Duration;

/// Events emitted by a log instance.
#[derive(Clone, Debug)]
pub enum LogEvent<P> {
    /// A message was durably applied; carries the new tree root hash.
    Commit { root: [u8; 32] },
    /// A message entered the log.
    Message {
        id: MessageId,
        signature: Option<Signature>,
        message: Message<P>,
    },
    /// A sync session against `peer` finished.
    Sync {
        peer: String,
        message_count: usize,
        duration: Duration,
    },
}
