//! WebSocket client for the relay.
//!
//! `WsRelay` implements the core `Relay` trait, so a `NoteSession` can join a
//! room on a remote relay server. `stay_connected` keeps a session joined,
//! retrying with exponential backoff while the relay is unreachable.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use collab_core::transport::Result;
use collab_core::{CollabConfig, Hello, NoteSession, Relay, RelayConnection, ReplicaId, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// A relay server reachable at a `ws://` URL.
pub struct WsRelay {
    url: String,
}

impl WsRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// None when no relay is configured.
    pub fn from_config(config: &CollabConfig) -> Option<Self> {
        config.relay_url.as_deref().map(Self::new)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn connect(&self, room: &str, hello: &Hello) -> Result<Box<dyn RelayConnection>> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.url, e)))?;
        let (mut write, read) = ws.split();

        let handshake = HandshakeMessage::new(room, hello)
            .to_binary()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        write
            .send(Message::Binary(handshake.into()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("Joined room {} on {} as {}", room, self.url, hello.replica_id);
        Ok(Box::new(WsConnection {
            id: hello.replica_id,
            write: Mutex::new(write),
            read: Mutex::new(read),
        }))
    }
}

/// An open relay room over a WebSocket.
pub struct WsConnection {
    id: ReplicaId,
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl RelayConnection for WsConnection {
    fn connection_id(&self) -> ReplicaId {
        self.id
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.write
            .lock()
            .await
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut read = self.read.lock().await;
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };
            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Dropping oversized frame from relay ({} bytes)", data.len());
                continue;
            }
            return Ok(data);
        }
    }

    async fn close(&self) -> Result<()> {
        self.write
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Keep `session` joined to its room on `relay` until the future is dropped.
///
/// Failed attempts are retried after `calculate_backoff`; the attempt count
/// resets once a connection succeeds.
pub async fn stay_connected(session: &NoteSession, relay: &dyn Relay, config: &ReconnectConfig) {
    let mut status = session.connection_changes();
    let mut attempts = 0u32;
    loop {
        if !*status.borrow_and_update() {
            match session.connect(relay).await {
                Ok(()) => {
                    if attempts > 0 {
                        info!("Note {} reconnected after {} attempts", session.note_id(), attempts);
                    }
                    attempts = 0;
                }
                Err(e) => {
                    attempts += 1;
                    let delay = calculate_backoff(attempts, config);
                    warn!(
                        "Note {}: connect attempt {} failed ({}), retrying in {:?}",
                        session.note_id(),
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}
