//! Debounced persistence of a note body to the durable store.
//!
//! `PersistenceAdapter` loads a body (CRDT snapshot first, then markup, then
//! empty) and writes it back. `FlushScheduler` coalesces bursts of edits into
//! one write after a quiescence window; at most one write is in flight.

use crate::document::{DocumentError, NoteBody};
use crate::model::{DocKey, Note};
use crate::replica_id::ReplicaId;
use crate::store::{DocumentStore, NotePatch, Patch, StoreError};
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Save indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
}

/// Where a hydrated body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationSource {
    Snapshot,
    Markup,
    /// Stored content was unreadable; the body starts empty.
    Empty,
}

/// Reads and writes one note's body.
///
/// Clones share one write lock, so at most one flush per note is in flight
/// whether it came from the debounce window or from an explicit flush.
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn DocumentStore>,
    note_id: String,
    writing: Arc<tokio::sync::Mutex<()>>,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn DocumentStore>, note_id: impl Into<String>) -> Self {
        Self {
            store,
            note_id: note_id.into(),
            writing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    fn key(&self) -> DocKey {
        DocKey::Note(self.note_id.clone())
    }

    pub async fn load(&self) -> Result<Note> {
        let doc = self
            .store
            .get(&self.key())
            .await?
            .ok_or_else(|| StoreError::NotFound(self.key().to_string()))?;
        doc.as_note()
            .cloned()
            .ok_or_else(|| StoreError::Invalid(format!("{} is not a note", self.key())).into())
    }

    /// Build the body for a new session.
    pub async fn hydrate(&self, replica: ReplicaId) -> Result<(NoteBody, HydrationSource)> {
        let note = self.load().await?;

        if let Some(state) = &note.crdt_state {
            match NoteBody::from_snapshot(state, replica) {
                Ok(body) => return Ok((body, HydrationSource::Snapshot)),
                Err(e) => warn!("Note {}: unreadable snapshot, falling back to markup: {}", self.note_id, e),
            }
        }

        match NoteBody::hydrate(&self.note_id, &note.content, replica) {
            Ok(body) => Ok((body, HydrationSource::Markup)),
            Err(DocumentError::Markup(e)) => {
                warn!("Note {}: malformed content, starting empty: {}", self.note_id, e);
                Ok((NoteBody::new(replica)?, HydrationSource::Empty))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Latest durable snapshot, if one was ever flushed.
    pub async fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.load().await?.crdt_state)
    }

    /// Write the body's markup and snapshot to the note.
    ///
    /// Waits for a flush already in flight, then snapshots the body, so a
    /// later flush never writes older content than an earlier one.
    pub async fn flush(&self, body: &Mutex<NoteBody>) -> Result<()> {
        let _writing = self.writing.lock().await;
        let (content, snapshot) = {
            let body = body.lock().unwrap_or_else(|e| e.into_inner());
            (body.serialize(), body.export_snapshot()?)
        };

        self.store
            .update(
                &self.key(),
                Patch::Note(NotePatch {
                    content: Some(content),
                    crdt_state: Some(snapshot),
                    updated_at: Some(Utc::now()),
                    ..Default::default()
                }),
            )
            .await?;
        debug!("Flushed note {}", self.note_id);
        Ok(())
    }
}

/// The write a `FlushScheduler` performs.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

enum Command {
    Schedule,
    Cancel,
}

/// Debounces flush requests.
///
/// Each `schedule` restarts the quiescence window; the flush runs once the
/// window elapses without another request. Requests made while a flush is
/// running start a new window after it completes. Dropping the scheduler
/// cancels any pending flush without running it.
pub struct FlushScheduler {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl FlushScheduler {
    /// Must be called within a tokio runtime.
    pub fn new(window: Duration, flush: FlushFn) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_scheduler(window, flush, rx));
        Self { commands, task }
    }

    pub fn schedule(&self) {
        let _ = self.commands.send(Command::Schedule);
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_scheduler(window: Duration, flush: FlushFn, mut rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        match rx.recv().await {
            None => return,
            Some(Command::Cancel) => continue,
            Some(Command::Schedule) => {}
        }

        let mut deadline = Instant::now() + window;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    flush().await;
                    break;
                }
                cmd = rx.recv() => match cmd {
                    None => return,
                    Some(Command::Schedule) => deadline = Instant::now() + window,
                    Some(Command::Cancel) => {
                        info!("Pending flush cancelled");
                        break;
                    }
                },
            }
        }
    }
}
