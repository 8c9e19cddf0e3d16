//! Responder loop: answers sync requests on a byte stream
//!
//! One call serves one session; sessions are independent per peer and run
//! until the peer hangs up or the shutdown signal fires.

use crate::client::NetError;
use crate::framing::{write_frame, Frame, FrameReader, FrameType};
use gossiplog::store::MessageStore;
use gossiplog::sync::{SyncRequest, SyncServer};
use gossiplog::tree::TreeStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Serve sync requests over `io` until end of stream or shutdown.
pub async fn serve_sync<IO, T, S>(
    io: IO,
    tree: &T,
    store: &S,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), NetError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    T: TreeStore + ?Sized,
    S: MessageStore + ?Sized,
{
    let server = SyncServer::new(tree, store);
    let (read_half, mut write_half) = tokio::io::split(io);
    let mut reader = FrameReader::new(read_half);

    loop {
        tokio::select! {
            frame = reader.read_frame() => {
                let Some(frame) = frame? else {
                    debug!("sync peer hung up");
                    break;
                };
                match frame.frame_type {
                    FrameType::SyncRequest => {
                        let request: SyncRequest = postcard::from_bytes(&frame.payload)?;
                        debug!(seq = request.seq(), "sync request");
                        let response = server.handle(&request)?;
                        let payload = postcard::to_allocvec(&response)?;
                        write_frame(&mut write_half, Frame::new(FrameType::SyncResponse, payload))
                            .await?;
                    }
                    FrameType::Ping => {
                        write_frame(&mut write_half, Frame::pong()).await?;
                    }
                    FrameType::Pong => {}
                    other => {
                        warn!(frame_type = ?other, "ignoring unexpected frame");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("sync session shutting down");
                break;
            }
        }
    }

    Ok(())
}
