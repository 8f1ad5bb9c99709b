//! One member connection on the relay server.
//!
//! The first frame must be a handshake naming the room. After that the
//! connection pumps frames between the WebSocket and the member's outbox in
//! the `RoomHub` until either side goes away.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use anyhow::{anyhow, Result};
use collab_core::RoomHub;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one upgraded WebSocket until it closes.
pub async fn serve<S>(conn_id: &str, ws: WebSocketStream<S>, hub: Arc<RoomHub>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    let first = timeout(HANDSHAKE_TIMEOUT, next_frame(conn_id, &mut read))
        .await
        .map_err(|_| anyhow!("no handshake within {:?}", HANDSHAKE_TIMEOUT))?
        .ok_or_else(|| anyhow!("closed before handshake"))?;
    let (room, hello) = HandshakeMessage::from_binary(&first)?.into_hello()?;
    let replica_id = hello.replica_id;
    debug!("{} is {} ({}) in room {}", conn_id, replica_id, hello.identity.email, room);

    let (outbox, mut frames) = mpsc::unbounded_channel();
    hub.join(&room, hello, outbox.clone())?;

    loop {
        tokio::select! {
            incoming = next_frame(conn_id, &mut read) => match incoming {
                Some(data) => {
                    if let Err(e) = hub.handle(&room, replica_id, &data) {
                        warn!("Dropping frame from {} in room {}: {}", replica_id, room, e);
                    }
                }
                None => break,
            },
            Some(data) = frames.recv() => {
                if let Err(e) = write.send(Message::Binary(data.into())).await {
                    warn!("Failed to send to {}: {}", replica_id, e);
                    break;
                }
            }
        }
    }

    hub.detach(&room, replica_id, &outbox);
    info!("{} ({}) disconnected from room {}", conn_id, replica_id, room);
    Ok(())
}

/// Next data frame, or None once the stream is closed.
async fn next_frame<S>(conn_id: &str, read: &mut SplitStream<WebSocketStream<S>>) -> Option<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let data = match read.next().await? {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Close(_)) => {
                debug!("Received close frame from {}", conn_id);
                return None;
            }
            Ok(_) => continue,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                debug!("Connection {} closed", conn_id);
                return None;
            }
            Err(e) => {
                error!("WebSocket error on {}: {}", conn_id, e);
                return None;
            }
        };

        if data.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds max size ({} > {}), dropping",
                conn_id,
                data.len(),
                MAX_MESSAGE_SIZE
            );
            continue;
        }
        return Some(data);
    }
}
