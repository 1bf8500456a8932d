use common::protocol::FrameReader;
use common::Result;
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::time::timeout;

use super::ServerState;

/// Reads frames until the peer closes, a frame is malformed or a read
/// stalls past the read timeout. Frames are processed in arrival order.
///
/// Returns the number of frames read.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, state: Arc<ServerState>) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(stream);
    let mut frames = 0u64;

    loop {
        let frame = match timeout(state.read_timeout(), reader.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                trace!("{} closed after {} frames", peer, frames);
                return Ok(frames);
            }
            Ok(Err(e)) => {
                warn!("Dropping connection {} after {} frames: {}", peer, frames, e);
                return Err(e.into());
            }
            Err(_) => {
                debug!(
                    "Connection {} idle for {:?}, closing",
                    peer,
                    state.read_timeout()
                );
                return Ok(frames);
            }
        };

        frames += 1;
        state.process_frame(frame).await;
    }
}
