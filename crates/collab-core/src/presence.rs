//! Presence: ephemeral identity and cursor state per connection.
//!
//! Presence is not persisted and has no ordering guarantee: each connection's
//! latest state wins, and entries vanish when the connection leaves. Cursor
//! coordinates are normalized to 0..1 so they stay meaningful across viewports
//! of different sizes; each consumer rescales them to its own pixels.

use crate::replica_id::{fnv1a_hash, ReplicaId};
use crate::sync::RelayMessage;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Who is behind a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub color: String,
    pub avatar: Option<String>,
}

impl Identity {
    /// Identity with the stable color for `email`.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            name: name.into(),
            color: color_for(&email),
            email,
            avatar: None,
        }
    }

    /// Name to show next to a cursor; falls back to the email.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

/// Stable `#rrggbb` color derived from a string (usually an email).
pub fn color_for(seed: &str) -> String {
    format!("#{:06x}", fnv1a_hash(seed) & 0x00ff_ffff)
}

/// Pixel rectangle of the editing surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn sized(width: f64, height: f64) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width,
            height,
        }
    }
}

/// Cursor position normalized to the editing surface (0..1 on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Option<Self> {
        let in_bounds = |v: f64| (0.0..=1.0).contains(&v);
        (in_bounds(x) && in_bounds(y)).then_some(Self { x, y })
    }

    /// Normalize a pointer position. Returns None outside the viewport.
    pub fn from_pointer(client_x: f64, client_y: f64, viewport: Viewport) -> Option<Self> {
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            return None;
        }
        Self::new(
            (client_x - viewport.left) / viewport.width,
            (client_y - viewport.top) / viewport.height,
        )
    }

    /// Rescale to pixels in a consumer's viewport (floored).
    pub fn to_pixels(&self, viewport: Viewport) -> (i64, i64) {
        (
            (self.x * viewport.width).floor() as i64,
            (self.y * viewport.height).floor() as i64,
        )
    }
}

/// One connection's presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub identity: Identity,
    /// None when the pointer is not over the editing surface.
    pub cursor: Option<Cursor>,
}

/// Presence of another connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub connection_id: ReplicaId,
    pub state: PresenceState,
}

struct LocalPresence {
    state: PresenceState,
    last_sent: Option<Instant>,
    pending: bool,
}

/// Local presence publication plus the live view of everyone else.
pub struct PresenceChannel {
    local_id: ReplicaId,
    throttle: Duration,
    local: Mutex<LocalPresence>,
    others: watch::Sender<BTreeMap<ReplicaId, PresenceState>>,
}

impl PresenceChannel {
    pub fn new(local_id: ReplicaId, identity: Identity, throttle: Duration) -> Self {
        let (others, _) = watch::channel(BTreeMap::new());
        Self {
            local_id,
            throttle,
            local: Mutex::new(LocalPresence {
                state: PresenceState {
                    identity,
                    cursor: None,
                },
                last_sent: None,
                pending: false,
            }),
            others,
        }
    }

    pub fn local_id(&self) -> ReplicaId {
        self.local_id
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn local_state(&self) -> PresenceState {
        self.lock_local().state.clone()
    }

    fn lock_local(&self) -> std::sync::MutexGuard<'_, LocalPresence> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Update the local cursor.
    ///
    /// Returns the message to broadcast, or None when throttled. A throttled
    /// state is kept as pending and picked up by `flush_pending`.
    pub fn publish(&self, cursor: Option<Cursor>) -> Option<RelayMessage> {
        let mut local = self.lock_local();
        local.state.cursor = cursor;

        let now = Instant::now();
        let due = local
            .last_sent
            .is_none_or(|sent| now.duration_since(sent) >= self.throttle);
        if !due {
            local.pending = true;
            return None;
        }

        local.last_sent = Some(now);
        local.pending = false;
        Some(RelayMessage::Presence {
            from: self.local_id,
            state: local.state.clone(),
        })
    }

    /// Take the latest throttled state, if any.
    pub fn flush_pending(&self) -> Option<RelayMessage> {
        let mut local = self.lock_local();
        if !local.pending {
            return None;
        }
        local.pending = false;
        local.last_sent = Some(Instant::now());
        Some(RelayMessage::Presence {
            from: self.local_id,
            state: local.state.clone(),
        })
    }

    /// Message announcing the current local state, bypassing the throttle.
    pub fn announce(&self) -> RelayMessage {
        RelayMessage::Presence {
            from: self.local_id,
            state: self.local_state(),
        }
    }

    /// Integrate a relay message. Returns true if the set of others changed.
    pub fn apply(&self, msg: &RelayMessage) -> bool {
        match msg {
            RelayMessage::Welcome { members } => {
                let mut changed = false;
                self.others.send_modify(|others| {
                    let next: BTreeMap<_, _> = members
                        .iter()
                        .filter(|m| m.connection_id != self.local_id)
                        .map(|m| (m.connection_id, m.state.clone()))
                        .collect();
                    changed = *others != next;
                    *others = next;
                });
                changed
            }
            RelayMessage::Presence { from, state } if *from != self.local_id => {
                let mut changed = false;
                self.others.send_modify(|others| {
                    changed = others.get(from) != Some(state);
                    others.insert(*from, state.clone());
                });
                changed
            }
            RelayMessage::Left { from } => self.remove(*from),
            _ => false,
        }
    }

    /// Drop a connection's record. Returns true if it was present.
    pub fn remove(&self, connection_id: ReplicaId) -> bool {
        self.others
            .send_if_modified(|others| others.remove(&connection_id).is_some())
    }

    /// Forget everyone (on disconnect).
    pub fn clear(&self) {
        self.others.send_if_modified(|others| {
            let had_any = !others.is_empty();
            others.clear();
            had_any
        });
    }

    pub fn others_count(&self) -> usize {
        self.others.borrow().len()
    }

    pub fn others(&self) -> Vec<PeerPresence> {
        to_peers(&self.others.borrow())
    }

    /// Stream of the other connections' presence.
    ///
    /// Yields the current set immediately, then once per change. Each call
    /// starts a fresh stream, so consumers can resubscribe at any time.
    pub fn subscribe(&self) -> impl Stream<Item = Vec<PeerPresence>> + Send + 'static {
        let rx = self.others.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let peers = to_peers(&rx.borrow_and_update());
            Some((peers, (rx, false)))
        })
    }
}

fn to_peers(others: &BTreeMap<ReplicaId, PresenceState>) -> Vec<PeerPresence> {
    others
        .iter()
        .map(|(id, state)| PeerPresence {
            connection_id: *id,
            state: state.clone(),
        })
        .collect()
}
