//! Relay transport traits for relay-mode sessions.
//!
//! Implementations:
//! - `InMemoryRelay` (in `relay`) - channels into a shared `RoomHub`
//! - `WsRelay` (in collab-relay) - WebSocket client for the relay server

use crate::presence::Identity;
use crate::replica_id::ReplicaId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// What a replica tells the relay when joining a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub replica_id: ReplicaId,
    pub identity: Identity,
}

/// An open connection to one relay room.
///
/// `send` and `recv` may be called concurrently from different tasks.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Connection id other members see in presence and sync frames.
    fn connection_id(&self) -> ReplicaId;

    /// Send one encoded frame.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next frame (waits until one is available).
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Leave the room.
    async fn close(&self) -> Result<()>;
}

/// A relay service hosting rooms keyed by note id.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Join `room`. The first frame received is a `Welcome`.
    async fn connect(&self, room: &str, hello: &Hello) -> Result<Box<dyn RelayConnection>>;
}
