//! GossipLog wire transport
//!
//! Carries sync sessions over ordered, reliable byte streams:
//! - [`framing`]: length-prefixed frame codec
//! - [`client`]: initiator endpoint implementing the driver's source
//! - [`server`]: responder loop answering sync requests
//!
//! Transport/session negotiation is out of scope; both endpoints take an
//! already-established duplex byte channel.

pub mod client;
pub mod framing;
pub mod server;

pub use client::{NetError, SyncClient, DEFAULT_REQUEST_TIMEOUT};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use server::serve_sync;
