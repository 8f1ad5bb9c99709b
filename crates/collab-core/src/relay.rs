//! RoomHub: relay-side room state shared by every relay implementation.
//!
//! A room holds its members (with their latest presence and an outbox) and an
//! authoritative `NoteBody` that absorbs every update passing through. A
//! replica that (re)joins is resynchronised from that body even when no other
//! member is online.
//!
//! Frames are fanned out while the hub lock is held, so every member observes
//! updates in the relay's receipt order.
//!
//! When the last member leaves, the room is closed once its body is safe: it
//! never held any operation, or it was saved to the hub's `RoomArchive`. The
//! next join restores it from there. Without an archive, rooms with content
//! stay open for the lifetime of the hub.

use crate::document::NoteBody;
use crate::presence::{PeerPresence, PresenceState};
use crate::replica_id::ReplicaId;
use crate::sync::{RelayMessage, Result, SyncError, SyncMessage};
use crate::transport::{self, Hello, Relay, RelayConnection, TransportError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outgoing frame queue of one member.
pub type Outbox = mpsc::UnboundedSender<Vec<u8>>;

struct Member {
    state: PresenceState,
    outbox: Outbox,
}

struct Room {
    body: NoteBody,
    members: BTreeMap<ReplicaId, Member>,
}

impl Room {
    fn send_to(&self, to: ReplicaId, msg: &RelayMessage) {
        let Some(member) = self.members.get(&to) else {
            return;
        };
        match msg.encode() {
            Ok(frame) => {
                // A closed outbox means the member is mid-disconnect; leave() cleans up
                let _ = member.outbox.send(frame);
            }
            Err(e) => warn!("Failed to encode {} for {}: {}", msg.kind(), to, e),
        }
    }

    fn broadcast_except(&self, except: ReplicaId, msg: &RelayMessage) {
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", msg.kind(), e);
                return;
            }
        };
        for (id, member) in &self.members {
            if *id != except {
                let _ = member.outbox.send(frame.clone());
            }
        }
    }
}

/// Durable home for the bodies of rooms nobody is in.
pub trait RoomArchive: Send + Sync {
    /// Last snapshot saved for a room.
    fn load(&self, room_id: &str) -> io::Result<Option<Vec<u8>>>;

    fn save(&self, room_id: &str, snapshot: &[u8]) -> io::Result<()>;
}

/// All rooms of one relay.
#[derive(Default)]
pub struct RoomHub {
    rooms: Mutex<HashMap<String, Room>>,
    archive: Option<Arc<dyn RoomArchive>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close empty rooms into `archive` and reopen them from it.
    pub fn with_archive(archive: Arc<dyn RoomArchive>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            archive: Some(archive),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a member. Sends it a `Welcome` and announces it to the others.
    ///
    /// Joining again with the same id replaces the previous connection.
    pub fn join(&self, room_id: &str, hello: Hello, outbox: Outbox) -> Result<()> {
        let mut rooms = self.lock();
        if !rooms.contains_key(room_id) {
            let body = self.open_body(room_id)?;
            rooms.insert(
                room_id.to_string(),
                Room {
                    body,
                    members: BTreeMap::new(),
                },
            );
        }
        let Some(room) = rooms.get_mut(room_id) else {
            return Ok(());
        };

        let id = hello.replica_id;
        let state = PresenceState {
            identity: hello.identity,
            cursor: None,
        };

        let members = room
            .members
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(other, m)| PeerPresence {
                connection_id: *other,
                state: m.state.clone(),
            })
            .collect();

        room.members.insert(
            id,
            Member {
                state: state.clone(),
                outbox,
            },
        );
        info!(
            "{} joined room {} ({} members)",
            id,
            room_id,
            room.members.len()
        );

        room.send_to(id, &RelayMessage::Welcome { members });
        room.broadcast_except(id, &RelayMessage::Presence { from: id, state });
        Ok(())
    }

    /// Remove a member and tell the others.
    pub fn leave(&self, room_id: &str, id: ReplicaId) {
        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        if room.members.remove(&id).is_none() {
            return;
        }
        info!("{} left room {}", id, room_id);
        room.broadcast_except(id, &RelayMessage::Left { from: id });

        if room.members.is_empty() && self.park(room_id, &room.body) {
            rooms.remove(room_id);
            info!("Closed room {}", room_id);
        }
    }

    /// Body for a room being opened: the archived one if there is one.
    ///
    /// An archive that cannot be read fails the join rather than starting
    /// empty, since closing that room later would overwrite what it holds.
    fn open_body(&self, room_id: &str) -> Result<NoteBody> {
        let replica = ReplicaId::generate();
        if let Some(archive) = &self.archive {
            if let Some(snapshot) = archive.load(room_id)? {
                match NoteBody::from_snapshot(&snapshot, replica) {
                    Ok(body) => {
                        debug!("Reopened room {} from archive", room_id);
                        return Ok(body);
                    }
                    Err(e) => warn!("Room {}: archived body unreadable, starting empty: {}", room_id, e),
                }
            }
        }
        Ok(NoteBody::new(replica)?)
    }

    /// Whether an empty room's body can be dropped from memory.
    fn park(&self, room_id: &str, body: &NoteBody) -> bool {
        if body.version().is_empty() {
            return true;
        }
        let Some(archive) = &self.archive else {
            return false;
        };
        let saved = body
            .export_snapshot()
            .map_err(SyncError::from)
            .and_then(|snapshot| archive.save(room_id, &snapshot).map_err(SyncError::from));
        match saved {
            Ok(()) => true,
            Err(e) => {
                warn!("Room {}: keeping body in memory, archive failed: {}", room_id, e);
                false
            }
        }
    }

    /// Remove a member only if it is still served by `outbox`.
    ///
    /// A connection that was replaced by a newer join under the same id must
    /// not evict its successor when it finally closes.
    pub fn detach(&self, room_id: &str, id: ReplicaId, outbox: &Outbox) {
        let current = self
            .lock()
            .get(room_id)
            .and_then(|room| room.members.get(&id))
            .is_some_and(|member| member.outbox.same_channel(outbox));
        if current {
            self.leave(room_id, id);
        } else {
            debug!("{} already replaced in room {}", id, room_id);
        }
    }

    /// Process one frame from a member.
    pub fn handle(&self, room_id: &str, from: ReplicaId, frame: &[u8]) -> Result<()> {
        let msg = RelayMessage::decode(frame)?;
        let mut rooms = self.lock();
        let room = rooms
            .get_mut(room_id)
            .filter(|room| room.members.contains_key(&from))
            .ok_or_else(|| SyncError::Deserialization(format!("{from} is not in room {room_id}")))?;

        debug!("Room {}: {} from {}", room_id, msg.kind(), from);
        match msg {
            RelayMessage::Sync { message, .. } => {
                let is_update = matches!(message, SyncMessage::Update { .. });
                let forward = is_update.then(|| message.clone());

                let (reply, _changed) = room.body.process_sync_message(message)?;
                if let Some(reply) = reply {
                    room.send_to(
                        from,
                        &RelayMessage::Sync {
                            from,
                            message: reply,
                        },
                    );
                }
                // Forward even known updates: another member may still lack them
                if let Some(update) = forward {
                    room.broadcast_except(
                        from,
                        &RelayMessage::Sync {
                            from,
                            message: update,
                        },
                    );
                }
            }
            RelayMessage::Presence { state, .. } => {
                if let Some(member) = room.members.get_mut(&from) {
                    member.state = state.clone();
                }
                room.broadcast_except(from, &RelayMessage::Presence { from, state });
            }
            // Relay-originated frames are not accepted from members
            RelayMessage::Welcome { .. } | RelayMessage::Left { .. } => {}
        }
        Ok(())
    }

    /// Member ids of a room.
    pub fn members(&self, room_id: &str) -> Vec<ReplicaId> {
        self.lock()
            .get(room_id)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open rooms.
    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Visible text of the room's authoritative body.
    pub fn room_text(&self, room_id: &str) -> Option<String> {
        self.lock().get(room_id).map(|room| room.body.plain_text())
    }
}

/// In-process relay backed by a `RoomHub`.
#[derive(Default)]
pub struct InMemoryRelay {
    hub: Arc<RoomHub>,
    offline: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hub(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            offline: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> Arc<RoomHub> {
        Arc::clone(&self.hub)
    }

    /// Refuse new connections (simulates an outage).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop a member as if its network went away.
    pub fn kick(&self, room: &str, id: ReplicaId) {
        self.hub.leave(room, id);
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn connect(&self, room: &str, hello: &Hello) -> transport::Result<Box<dyn RelayConnection>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("relay offline".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .join(room, hello.clone(), tx)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(InMemoryConnection {
            id: hello.replica_id,
            room: room.to_string(),
            hub: Arc::clone(&self.hub),
            inbox: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemoryConnection {
    id: ReplicaId,
    room: String,
    hub: Arc<RoomHub>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

#[async_trait]
impl RelayConnection for InMemoryConnection {
    fn connection_id(&self) -> ReplicaId {
        self.id
    }

    async fn send(&self, data: &[u8]) -> transport::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.hub
            .handle(&self.room, self.id, data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> transport::Result<Vec<u8>> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) -> transport::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.leave(&self.room, self.id);
        }
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.leave(&self.room, self.id);
        }
    }
}
