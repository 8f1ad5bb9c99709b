//! Event infrastructure for note sessions.
//!
//! Provides `SessionEvent` for UI/monitoring and `EventBus` for subscriptions.

use crate::persistence::SaveStatus;
use crate::replica_id::ReplicaId;
use crate::session::SessionMode;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a note session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Persistence state changed ("Saving...", "Saved", idle).
    SaveStatusChanged {
        #[serde(rename = "noteId")]
        note_id: String,
        status: SaveStatus,
    },
    /// The coordinator switched sync strategy.
    ModeChanged {
        #[serde(rename = "noteId")]
        note_id: String,
        mode: SessionMode,
    },
    /// Operations from another replica changed the body.
    RemoteUpdateApplied {
        #[serde(rename = "noteId")]
        note_id: String,
        /// Sending replica (None for the room's resync response).
        from: Option<ReplicaId>,
    },
    /// The set of other connections changed.
    PresenceChanged {
        #[serde(rename = "noteId")]
        note_id: String,
        others: usize,
    },
    /// The relay connection went up or down.
    TransportStatusChanged {
        #[serde(rename = "noteId")]
        note_id: String,
        connected: bool,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Event bus for publishing session events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SessionEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn presence_event(others: usize) -> SessionEvent {
        SessionEvent::PresenceChanged {
            note_id: "n1".into(),
            others,
        }
    }

    #[test]
    fn test_subscribers_receive_events_in_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event);
        });

        bus.emit(presence_event(1));
        bus.emit(presence_event(0));

        assert_eq!(*seen.lock().unwrap(), vec![presence_event(1), presence_event(0)]);
    }

    #[test]
    fn test_dropping_one_subscription_keeps_others() {
        let bus = Arc::new(EventBus::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = Arc::clone(&first);
        let second_clone = Arc::clone(&second);
        let sub1 = bus.subscribe(move |_| {
            first_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            second_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(presence_event(1));
        drop(sub1);
        bus.emit(presence_event(2));

        assert_eq!(first.load(Ordering::Relaxed), 1);
        assert_eq!(second.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::ModeChanged {
            note_id: "n1".into(),
            mode: SessionMode::Collaborative,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"modeChanged\""));
        assert!(json.contains("\"noteId\":\"n1\""));
        assert!(json.contains("\"mode\":\"collaborative\""));
    }
}
