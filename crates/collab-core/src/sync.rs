//! Wire protocol for exchanging note body updates through a relay.
//!
//! Frames are bincode-encoded `RelayMessage`s. Document payloads inside them
//! are opaque Loro bytes (updates, snapshots, encoded version vectors).

use crate::presence::{PeerPresence, PresenceState};
use crate::replica_id::ReplicaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid version vector: {0}")]
    InvalidVersion(String),

    #[error("Document error: {0}")]
    Document(#[from] crate::document::DocumentError),

    #[error("Room archive error: {0}")]
    Archive(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Document sync messages between a replica and the relay room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Ask for everything missing since `version` (an encoded version vector).
    SyncRequest { version: Vec<u8> },

    /// Updates the requester is missing, plus the responder's version so the
    /// requester can push back what the responder lacks.
    SyncResponse { updates: Vec<u8>, version: Vec<u8> },

    /// Real-time operations from one replica.
    Update { data: Vec<u8> },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncRequest { .. } => "SyncRequest",
            SyncMessage::SyncResponse { .. } => "SyncResponse",
            SyncMessage::Update { .. } => "Update",
        }
    }
}

/// Frames exchanged with the relay.
///
/// Replicas send `Sync` and `Presence` (with their own id in `from`); the
/// relay overwrites `from` with the sender's connection id before fanning out,
/// and additionally sends `Welcome` and `Left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// First frame after joining: everyone already in the room.
    Welcome { members: Vec<PeerPresence> },

    Sync { from: ReplicaId, message: SyncMessage },

    Presence { from: ReplicaId, state: PresenceState },

    Left { from: ReplicaId },
}

impl RelayMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SyncError::Deserialization(e.to_string()))
    }

    /// Message type name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Welcome { .. } => "Welcome",
            RelayMessage::Sync { message, .. } => message.kind(),
            RelayMessage::Presence { .. } => "Presence",
            RelayMessage::Left { .. } => "Left",
        }
    }
}
