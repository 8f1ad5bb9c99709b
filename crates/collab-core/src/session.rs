//! NoteSession: one open note on one replica.
//!
//! A session owns the note body, persists it through a debounced
//! `FlushScheduler`, and optionally joins a relay room. Its mode follows
//! presence:
//!
//! ```text
//! Initializing --hydrated--> Solo --others appear--> Collaborative
//!                             ^                          |
//!                             +--others gone/disconnect--+
//! ```
//!
//! Entering collaborative mode merges the latest durable snapshot into the
//! body and resyncs with the room before local edits are propagated, so
//! nothing written while solo is lost or duplicated.

use crate::block::{Block, BlockId};
use crate::config::CollabConfig;
use crate::document::{DocumentError, LocalChange, LocalEdit, NoteBody};
use crate::enhance::{self, EnhanceError, TextEnhancer};
use crate::error::ActionError;
use crate::events::{EventBus, SessionEvent};
use crate::persistence::{
    FlushFn, FlushScheduler, PersistenceAdapter, PersistenceError, SaveStatus,
};
use crate::presence::{Cursor, Identity, PeerPresence, PresenceChannel};
use crate::replica_id::ReplicaId;
use crate::store::{DocumentStore, StoreError};
use crate::sync::{RelayMessage, SyncMessage};
use crate::transport::{Hello, Relay, RelayConnection, TransportError};
use futures::Stream;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Note not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for ActionError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => ActionError::NotFound(id),
            SessionError::Persistence(PersistenceError::Store(e)) => e.into(),
            SessionError::Persistence(PersistenceError::Document(e)) | SessionError::Document(e) => {
                e.into()
            }
            SessionError::Transport(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    Initializing,
    /// Local edits are only persisted.
    Solo,
    /// Local edits are also sent to the relay room.
    Collaborative,
}

struct Shared {
    note_id: String,
    body: Arc<Mutex<NoteBody>>,
    adapter: PersistenceAdapter,
    presence: PresenceChannel,
    events: Arc<EventBus>,
    mode: watch::Sender<SessionMode>,
    scheduler: FlushScheduler,
    /// Queue to the connection driver; None while disconnected.
    outbox: Mutex<Option<mpsc::UnboundedSender<RelayMessage>>>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn lock_body(&self) -> std::sync::MutexGuard<'_, NoteBody> {
        self.body.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mode(&self) -> SessionMode {
        *self.mode.borrow()
    }

    fn set_mode(&self, mode: SessionMode) {
        if self.mode.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        }) {
            info!("Note {} is now {:?}", self.note_id, mode);
            self.events.emit(SessionEvent::ModeChanged {
                note_id: self.note_id.clone(),
                mode,
            });
        }
    }

    fn send(&self, msg: RelayMessage) {
        let outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = outbox.as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn send_sync(&self, message: SyncMessage) {
        self.send(RelayMessage::Sync {
            from: self.presence.local_id(),
            message,
        });
    }

    /// Merge the durable snapshot, then ask the room for what we lack.
    async fn resync(&self) {
        match self.adapter.read_snapshot().await {
            Ok(Some(snapshot)) => {
                let merged = self.lock_body().apply_remote(&snapshot);
                match merged {
                    Ok(true) => debug!("Note {}: merged newer durable state", self.note_id),
                    Ok(false) => {}
                    Err(e) => warn!("Note {}: durable snapshot not merged: {}", self.note_id, e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Note {}: could not re-read durable state: {}", self.note_id, e),
        }
        let request = self.lock_body().prepare_sync_request();
        self.send_sync(request);
    }

    async fn update_mode_from_presence(&self) {
        let others = self.presence.others_count();
        match (self.mode(), others) {
            (SessionMode::Solo, n) if n > 0 => {
                self.resync().await;
                self.set_mode(SessionMode::Collaborative);
            }
            (SessionMode::Collaborative, 0) => self.set_mode(SessionMode::Solo),
            _ => {}
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let msg = match RelayMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Note {}: dropping undecodable frame: {}", self.note_id, e);
                return;
            }
        };

        match msg {
            RelayMessage::Sync { from, message } => {
                let is_response = matches!(message, SyncMessage::SyncResponse { .. });
                let processed = self.lock_body().process_sync_message(message);
                match processed {
                    Ok((reply, changed)) => {
                        if let Some(reply) = reply {
                            self.send_sync(reply);
                        }
                        if changed {
                            self.events.emit(SessionEvent::RemoteUpdateApplied {
                                note_id: self.note_id.clone(),
                                from: (!is_response).then_some(from),
                            });
                            self.scheduler.schedule();
                        }
                    }
                    Err(e) => warn!("Note {}: sync message from {} rejected: {}", self.note_id, from, e),
                }
            }
            presence @ (RelayMessage::Welcome { .. }
            | RelayMessage::Presence { .. }
            | RelayMessage::Left { .. }) => {
                let is_welcome = matches!(presence, RelayMessage::Welcome { .. });
                if self.presence.apply(&presence) {
                    self.events.emit(SessionEvent::PresenceChanged {
                        note_id: self.note_id.clone(),
                        others: self.presence.others_count(),
                    });
                }
                if is_welcome && self.presence.others_count() == 0 {
                    // Alone in the room: still pick up what it holds
                    self.resync().await;
                }
                self.update_mode_from_presence().await;
            }
        }
    }

    fn on_disconnected(&self) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.connected.send_replace(false);
        let had_others = self.presence.others_count() > 0;
        self.presence.clear();
        if had_others {
            self.events.emit(SessionEvent::PresenceChanged {
                note_id: self.note_id.clone(),
                others: 0,
            });
        }
        self.events.emit(SessionEvent::TransportStatusChanged {
            note_id: self.note_id.clone(),
            connected: false,
        });
        if self.mode() == SessionMode::Collaborative {
            self.set_mode(SessionMode::Solo);
        }
    }
}

struct Connection {
    conn: Arc<dyn RelayConnection>,
    driver: JoinHandle<()>,
}

/// One open note.
pub struct NoteSession {
    shared: Arc<Shared>,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl NoteSession {
    /// Open a note: hydrate its body and enter solo mode.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        note_id: &str,
        identity: Identity,
        config: &CollabConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let replica = ReplicaId::generate();
        let (mode, _) = watch::channel(SessionMode::Initializing);
        let (connected, _) = watch::channel(false);

        let adapter = PersistenceAdapter::new(store, note_id);
        let (body, source) = adapter.hydrate(replica).await.map_err(|e| match e {
            PersistenceError::Store(StoreError::NotFound(_)) => SessionError::NotFound(note_id.to_string()),
            other => other.into(),
        })?;
        info!("Opened note {} as {} ({:?})", note_id, replica, source);

        let body = Arc::new(Mutex::new(body));
        let scheduler = FlushScheduler::new(
            config.flush_window,
            flush_fn(note_id, Arc::clone(&body), adapter.clone(), Arc::clone(&events)),
        );

        let shared = Arc::new(Shared {
            note_id: note_id.to_string(),
            body,
            adapter,
            presence: PresenceChannel::new(replica, identity, config.presence_throttle),
            events,
            mode,
            scheduler,
            outbox: Mutex::new(None),
            connected,
        });
        shared.set_mode(SessionMode::Solo);

        Ok(Self {
            shared,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    pub fn note_id(&self) -> &str {
        &self.shared.note_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.shared.presence.local_id()
    }

    pub fn mode(&self) -> SessionMode {
        self.shared.mode()
    }

    /// Watch mode transitions.
    pub fn mode_changes(&self) -> watch::Receiver<SessionMode> {
        self.shared.mode.subscribe()
    }

    /// Apply a local edit, schedule a flush and propagate it when collaborative.
    pub fn edit(&self, edit: &LocalEdit) -> Result<LocalChange> {
        let change = self.shared.lock_body().apply_local_edit(edit)?;
        self.propagate(&change);
        Ok(change)
    }

    /// Rewrite the given blocks through `enhancer`.
    ///
    /// The body stays editable while the service call is outstanding.
    pub async fn enhance(
        &self,
        ids: &[BlockId],
        enhancer: &dyn TextEnhancer,
    ) -> std::result::Result<LocalChange, EnhanceError> {
        let (selected, text) = {
            let body = self.shared.lock_body();
            enhance::selection_text(&body, ids)?
        };
        let enhanced = enhancer.enhance(&text).await?;

        let mut body = self.shared.lock_body();
        let before = body.version();
        let applied = enhance::apply_enhancement(&mut body, &selected, &enhanced);
        let change = match applied {
            Ok(change) => change,
            Err(e) => {
                // Whatever was committed before the failure still has to reach the room
                if body.version() != before {
                    let update = body.export_updates(&before)?;
                    drop(body);
                    warn!("Note {}: enhancement failed part way: {}", self.shared.note_id, e);
                    self.propagate(&LocalChange { update, created: None });
                }
                return Err(e);
            }
        };
        drop(body);
        self.propagate(&change);
        Ok(change)
    }

    fn propagate(&self, change: &LocalChange) {
        if change.is_empty() {
            return;
        }
        self.shared.scheduler.schedule();
        if self.shared.mode() == SessionMode::Collaborative {
            self.shared.send_sync(SyncMessage::Update {
                data: change.update.clone(),
            });
        }
    }

    /// Current block tree.
    pub fn blocks(&self) -> Vec<Block> {
        self.shared.lock_body().blocks()
    }

    /// Body as markup.
    pub fn serialize(&self) -> String {
        self.shared.lock_body().serialize()
    }

    pub fn plain_text(&self) -> String {
        self.shared.lock_body().plain_text()
    }

    /// Run `f` against the body.
    pub fn with_body<R>(&self, f: impl FnOnce(&NoteBody) -> R) -> R {
        f(&self.shared.lock_body())
    }

    /// Publish the local cursor (throttled).
    pub fn publish_cursor(&self, cursor: Option<Cursor>) {
        if let Some(msg) = self.shared.presence.publish(cursor) {
            self.shared.send(msg);
        }
    }

    pub fn others(&self) -> Vec<PeerPresence> {
        self.shared.presence.others()
    }

    pub fn subscribe_presence(&self) -> impl Stream<Item = Vec<PeerPresence>> + Send + 'static {
        self.shared.presence.subscribe()
    }

    /// Watch relay connectivity.
    pub fn connection_changes(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Write the body now, bypassing the debounce window.
    pub async fn flush_now(&self) -> Result<()> {
        self.shared.scheduler.cancel();
        self.shared.adapter.flush(&self.shared.body).await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Join the note's relay room.
    ///
    /// Failure leaves the session usable in solo mode.
    pub async fn connect(&self, relay: &dyn Relay) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(old) = slot.take() {
            close_connection(&self.shared, old).await;
        }

        let hello = Hello {
            replica_id: self.replica(),
            identity: self.shared.presence.local_state().identity,
        };
        let conn: Arc<dyn RelayConnection> = match relay.connect(&self.shared.note_id, &hello).await {
            Ok(conn) => Arc::from(conn),
            Err(e) => {
                warn!("Note {}: relay unavailable: {}", self.shared.note_id, e);
                self.shared.events.emit(SessionEvent::TransportStatusChanged {
                    note_id: self.shared.note_id.clone(),
                    connected: false,
                });
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.shared.connected.send_replace(true);
        self.shared.events.emit(SessionEvent::TransportStatusChanged {
            note_id: self.shared.note_id.clone(),
            connected: true,
        });

        let driver = tokio::spawn(drive(Arc::clone(&self.shared), Arc::clone(&conn), rx));
        *slot = Some(Connection { conn, driver });
        Ok(())
    }

    /// Drop the current connection (if any) and join again.
    pub async fn reconnect(&self, relay: &dyn Relay) -> Result<()> {
        self.disconnect().await;
        self.connect(relay).await
    }

    pub async fn disconnect(&self) {
        if let Some(old) = self.connection.lock().await.take() {
            close_connection(&self.shared, old).await;
        }
    }

    /// Leave the room and stop the session. A pending flush is cancelled.
    pub async fn close(self) {
        self.shared.scheduler.cancel();
        self.disconnect().await;
        info!("Closed note {}", self.shared.note_id);
    }
}

impl Drop for NoteSession {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.driver.abort();
        }
    }
}

async fn close_connection(shared: &Shared, connection: Connection) {
    connection.driver.abort();
    if let Err(e) = connection.conn.close().await {
        debug!("Closing relay connection: {}", e);
    }
    shared.on_disconnected();
}

fn flush_fn(
    note_id: &str,
    body: Arc<Mutex<NoteBody>>,
    adapter: PersistenceAdapter,
    events: Arc<EventBus>,
) -> FlushFn {
    let note_id = note_id.to_string();
    Arc::new(move || {
        let note_id = note_id.clone();
        let body = Arc::clone(&body);
        let adapter = adapter.clone();
        let events = Arc::clone(&events);
        Box::pin(async move {
            events.emit(SessionEvent::SaveStatusChanged {
                note_id: note_id.clone(),
                status: SaveStatus::Saving,
            });
            let status = match adapter.flush(&body).await {
                Ok(()) => SaveStatus::Saved,
                Err(e) => {
                    error!("Failed to save note {}: {}", note_id, e);
                    SaveStatus::Idle
                }
            };
            events.emit(SessionEvent::SaveStatusChanged { note_id, status });
        })
    })
}

/// Pump frames between the connection and the session until either side ends.
async fn drive(
    shared: Arc<Shared>,
    conn: Arc<dyn RelayConnection>,
    mut outbox: mpsc::UnboundedReceiver<RelayMessage>,
) {
    let period = shared.presence.throttle().max(Duration::from_millis(1));
    let mut presence_tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            frame = conn.recv() => match frame {
                Ok(frame) => shared.handle_frame(&frame).await,
                Err(e) => {
                    warn!("Note {}: relay connection lost: {}", shared.note_id, e);
                    break;
                }
            },
            Some(msg) = outbox.recv() => {
                let sent = match msg.encode() {
                    Ok(frame) => conn.send(&frame).await,
                    Err(e) => {
                        warn!("Note {}: cannot encode {}: {}", shared.note_id, msg.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sent {
                    warn!("Note {}: send failed: {}", shared.note_id, e);
                    break;
                }
            }
            _ = presence_tick.tick() => {
                if let Some(msg) = shared.presence.flush_pending() {
                    shared.send(msg);
                }
            }
        }
    }
    shared.on_disconnected();
}
