//! collab-relay: WebSocket relay for collaborative note rooms.
//!
//! The server side hosts a `RoomHub` behind WebSocket connections; the client
//! side implements the core `Relay` trait so note sessions can join rooms on
//! a remote relay. Empty rooms can be closed into a `FileRoomArchive`.

pub mod archive;
pub mod client;
pub mod connection;
pub mod message;
pub mod server;

pub use archive::FileRoomArchive;
pub use client::{calculate_backoff, stay_connected, ReconnectConfig, WsConnection, WsRelay};
pub use message::{HandshakeError, HandshakeMessage, MAX_MESSAGE_SIZE};
pub use server::RelayServer;
