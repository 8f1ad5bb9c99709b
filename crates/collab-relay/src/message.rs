//! Join handshake.
//!
//! The first frame a client sends is UTF-8 JSON naming the room it wants and
//! who it is. Every later frame in either direction is a bincode
//! `RelayMessage`.

use collab_core::{Hello, Identity, ReplicaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (16MB). Larger frames are dropped unread.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a handshake, got {0:?}")]
    WrongType(String),

    #[error("Invalid replica id: {0}")]
    ReplicaId(#[from] collab_core::ReplicaIdError),

    #[error("Room name is empty")]
    EmptyRoom,
}

/// Handshake sent by a client when it opens a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Hex replica id, also used as the connection id in the room
    pub replica_id: String,

    /// Room to join (the note id)
    pub room: String,

    pub name: String,
    pub email: String,
    pub color: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl HandshakeMessage {
    pub fn new(room: &str, hello: &Hello) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            replica_id: hello.replica_id.to_string(),
            room: room.to_string(),
            name: hello.identity.name.clone(),
            email: hello.identity.email.clone(),
            color: hello.identity.color.clone(),
            avatar: hello.identity.avatar.clone(),
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_binary(&self) -> Result<Vec<u8>, HandshakeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate a handshake frame.
    pub fn from_binary(data: &[u8]) -> Result<Self, HandshakeError> {
        let msg: Self = serde_json::from_slice(data)?;
        if msg.msg_type != "handshake" {
            return Err(HandshakeError::WrongType(msg.msg_type));
        }
        if msg.room.trim().is_empty() {
            return Err(HandshakeError::EmptyRoom);
        }
        Ok(msg)
    }

    /// The room name and the `Hello` the room hub expects.
    pub fn into_hello(self) -> Result<(String, Hello), HandshakeError> {
        let replica_id: ReplicaId = self.replica_id.parse()?;
        let hello = Hello {
            replica_id,
            identity: Identity {
                name: self.name,
                email: self.email,
                color: self.color,
                avatar: self.avatar,
            },
        };
        Ok((self.room, hello))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Hello {
        Hello {
            replica_id: ReplicaId::from(0xabc),
            identity: Identity::new("Ada", "ada@example.com"),
        }
    }

    #[test]
    fn test_handshake_wire_format() {
        let msg = HandshakeMessage::new("note-1", &hello());
        let json: serde_json::Value = serde_json::from_slice(&msg.to_binary().unwrap()).unwrap();

        assert_eq!(json["type"], "handshake");
        assert_eq!(json["replicaId"], "0000000000000abc");
        assert_eq!(json["room"], "note-1");
        assert_eq!(json["name"], "Ada");
        assert!(json.get("avatar").is_none());
    }

    #[test]
    fn test_handshake_into_hello() {
        let original = hello();
        let bytes = HandshakeMessage::new("note-1", &original).to_binary().unwrap();
        let (room, parsed) = HandshakeMessage::from_binary(&bytes)
            .unwrap()
            .into_hello()
            .unwrap();

        assert_eq!(room, "note-1");
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_rejects_bad_handshakes() {
        assert!(matches!(
            HandshakeMessage::from_binary(b"not json at all"),
            Err(HandshakeError::Json(_))
        ));
        assert!(matches!(
            HandshakeMessage::from_binary(br#"{"type":"other","replicaId":"1","room":"r","name":"","email":"","color":""}"#),
            Err(HandshakeError::WrongType(_))
        ));
        assert!(matches!(
            HandshakeMessage::from_binary(br#"{"type":"handshake","replicaId":"1","room":" ","name":"","email":"","color":""}"#),
            Err(HandshakeError::EmptyRoom)
        ));

        let bad_id = HandshakeMessage::from_binary(
            br#"{"type":"handshake","replicaId":"xyz","room":"r","name":"","email":"","color":""}"#,
        )
        .unwrap();
        assert!(matches!(bad_id.into_hello(), Err(HandshakeError::ReplicaId(_))));
    }
}
