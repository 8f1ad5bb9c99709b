//! collab-core: real-time collaborative note editing on Loro CRDTs.
//!
//! This crate provides the core functionality for:
//! - Note bodies as a CRDT tree of typed blocks with styled inline text
//! - Markup (HTML subset) projection and hydration of bodies
//! - Sync protocol and relay rooms with presence
//! - Debounced persistence to a durable `DocumentStore`
//! - Note sessions switching between solo and collaborative modes
//! - Note, access-grant and reminder actions with atomic batch writes

pub mod block;
pub mod config;
pub mod document;
pub mod enhance;
pub mod error;
pub mod events;
pub mod markup;
pub mod model;
pub mod notes;
pub mod persistence;
pub mod presence;
pub mod relay;
pub mod reminders;
pub mod replica_id;
pub mod session;
pub mod store;
pub mod sync;
pub mod sync_engine;
pub mod transport;

pub use block::{Block, BlockContent, BlockId, BlockKind, InlineStyle, TextRun};
pub use config::{CollabConfig, ConfigError};
pub use document::{DocumentError, LocalChange, LocalEdit, NoteBody};
pub use enhance::{EnhanceError, HttpEnhancer, TextEnhancer};
pub use error::{ActionError, ActionResult, Caller};
pub use events::{EventBus, SessionEvent, Subscription};
pub use model::{AccessGrant, DocKey, Flag, Note, Reminder, Role, StoredDocument, UserProfile};
pub use notes::{NoteActions, NoteListing};
pub use persistence::{FlushScheduler, PersistenceAdapter, SaveStatus};
pub use presence::{Cursor, Identity, PeerPresence, PresenceChannel, PresenceState, Viewport};
pub use relay::{InMemoryRelay, RoomArchive, RoomHub};
pub use reminders::{PushDelivery, PushPayload, ReminderActions, ReminderDraft, SweepReport};
pub use replica_id::{ReplicaId, ReplicaIdError};
pub use session::{NoteSession, SessionError, SessionMode};
pub use store::{DocumentStore, InMemoryStore, Query, StoreError, WriteBatch};
pub use sync::{RelayMessage, SyncError, SyncMessage};
pub use transport::{Hello, Relay, RelayConnection, TransportError};
