//! Sync client: drives requests over a framed stream
//!
//! Implements the driver's source abstraction against a remote responder.
//! Responses are correlated by sequence number, so a response arriving for a
//! different in-flight request is parked rather than dropped.

use crate::framing::{write_frame, Frame, FrameError, FrameReader, FrameType};
use gossiplog::sync::{SyncError, SyncRequest, SyncResponse, SyncSource};
use gossiplog::tree::Node;
use gossiplog_core::MessageId;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Network transport errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("store error: {0}")]
    Store(#[from] gossiplog::StoreError),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unexpected frame type: {0:?}")]
    UnexpectedFrame(FrameType),
}

impl From<NetError> for SyncError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Timeout => SyncError::Timeout,
            NetError::ConnectionClosed => SyncError::ChannelClosed,
            NetError::Store(e) => SyncError::Store(e),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

/// Initiator endpoint for one sync session over a duplex byte stream.
pub struct SyncClient<IO> {
    reader: FrameReader<ReadHalf<IO>>,
    writer: WriteHalf<IO>,
    next_seq: u64,
    parked: HashMap<u64, SyncResponse>,
    timeout: Duration,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> SyncClient<IO> {
    pub fn new(io: IO) -> Self {
        Self::with_timeout(io, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(io: IO, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
            next_seq: 0,
            parked: HashMap::new(),
            timeout,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    async fn call(&mut self, request: SyncRequest) -> Result<SyncResponse, NetError> {
        let seq = request.seq();
        let payload = postcard::to_allocvec(&request)?;
        write_frame(&mut self.writer, Frame::new(FrameType::SyncRequest, payload)).await?;
        debug!(seq, "sync request sent");

        loop {
            if let Some(response) = self.parked.remove(&seq) {
                return Ok(response);
            }

            let frame = tokio::time::timeout(self.timeout, self.reader.read_frame())
                .await
                .map_err(|_| NetError::Timeout)??
                .ok_or(NetError::ConnectionClosed)?;

            match frame.frame_type {
                FrameType::SyncResponse => {
                    let response: SyncResponse = postcard::from_bytes(&frame.payload)?;
                    if response.seq() == seq {
                        return Ok(response);
                    }
                    self.parked.insert(response.seq(), response);
                }
                FrameType::Ping => {
                    write_frame(&mut self.writer, Frame::pong()).await?;
                }
                FrameType::Pong => {}
                other => return Err(NetError::UnexpectedFrame(other)),
            }
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> SyncSource for SyncClient<IO> {
    async fn get_root(&mut self) -> Result<Node, SyncError> {
        let seq = self.next_seq();
        match self.call(SyncRequest::GetRoot { seq }).await? {
            SyncResponse::Root { root, .. } => Ok(root),
            other => Err(SyncError::Protocol(format!(
                "expected root response, got {other:?}"
            ))),
        }
    }

    async fn get_node(
        &mut self,
        level: u32,
        key: Option<&[u8]>,
    ) -> Result<Option<Node>, SyncError> {
        let seq = self.next_seq();
        let request = SyncRequest::GetNode {
            seq,
            level,
            key: key.map(<[u8]>::to_vec),
        };
        match self.call(request).await? {
            SyncResponse::Node { node, .. } => Ok(node),
            other => Err(SyncError::Protocol(format!(
                "expected node response, got {other:?}"
            ))),
        }
    }

    async fn get_children(
        &mut self,
        level: u32,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<Node>>, SyncError> {
        let seq = self.next_seq();
        let request = SyncRequest::GetChildren {
            seq,
            level,
            key: key.map(<[u8]>::to_vec),
        };
        match self.call(request).await? {
            SyncResponse::Children { children, .. } => Ok(children),
            other => Err(SyncError::Protocol(format!(
                "expected children response, got {other:?}"
            ))),
        }
    }

    async fn get_values(
        &mut self,
        keys: &[MessageId],
    ) -> Result<Vec<Option<Vec<u8>>>, SyncError> {
        let seq = self.next_seq();
        let request = SyncRequest::GetValues {
            seq,
            keys: keys.to_vec(),
        };
        match self.call(request).await? {
            SyncResponse::Values { values, .. } => Ok(values),
            other => Err(SyncError::Protocol(format!(
                "expected values response, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut client = SyncClient::with_timeout(a, Duration::from_millis(50));
        assert!(matches!(
            client.get_root().await,
            Err(SyncError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_closed_peer_fails_the_request() {
        let (a, b) = tokio::io::duplex(1024);
        drop(b);
        let mut client = SyncClient::new(a);
        assert!(client.get_root().await.is_err());
    }
}
