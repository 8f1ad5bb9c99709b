//! DocumentStore trait abstraction over the durable document database.
//!
//! Implementations:
//! - `InMemoryStore` - For testing and single-process use, with fault injection
//!
//! The store offers single-document reads and writes, atomic multi-document
//! batches, field queries, and a change feed for push-on-change queries.

use crate::model::{DocKey, StoredDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document: {0}")]
    Invalid(String),

    #[error("Cannot apply {patch} patch to {key}")]
    PatchMismatch { key: String, patch: &'static str },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Field-level update to an access grant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantPatch {
    pub title: Option<String>,
    pub archived: Option<bool>,
    pub icon: Option<String>,
    pub cover_image: Option<String>,
    pub quick_access: Option<bool>,
}

/// Field-level update to a note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub crdt_state: Option<Vec<u8>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Field-level update to a reminder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReminderPatch {
    pub message: Option<String>,
    pub reminder_time: Option<DateTime<Utc>>,
    pub is_sent: Option<bool>,
    pub is_done: Option<bool>,
    pub note_id: Option<Option<String>>,
    pub note_title: Option<Option<String>>,
    pub flag_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Grant(GrantPatch),
    Note(NotePatch),
    Reminder(ReminderPatch),
}

impl Patch {
    fn name(&self) -> &'static str {
        match self {
            Patch::Grant(_) => "grant",
            Patch::Note(_) => "note",
            Patch::Reminder(_) => "reminder",
        }
    }

    /// Apply to a document of the matching kind.
    pub fn apply(&self, key: &DocKey, doc: &mut StoredDocument) -> Result<()> {
        match (self, doc) {
            (Patch::Grant(p), StoredDocument::AccessGrant(g)) => {
                if let Some(title) = &p.title {
                    g.title = title.clone();
                }
                if let Some(archived) = p.archived {
                    g.archived = archived;
                }
                if let Some(icon) = &p.icon {
                    g.icon = icon.clone();
                }
                if let Some(cover) = &p.cover_image {
                    g.cover_image = cover.clone();
                }
                if let Some(quick_access) = p.quick_access {
                    g.quick_access = quick_access;
                }
                g.updated_at = Utc::now();
            }
            (Patch::Note(p), StoredDocument::Note(n)) => {
                if let Some(title) = &p.title {
                    n.title = title.clone();
                }
                if let Some(content) = &p.content {
                    n.content = content.clone();
                }
                if let Some(state) = &p.crdt_state {
                    n.crdt_state = Some(state.clone());
                }
                n.updated_at = p.updated_at.unwrap_or_else(Utc::now);
            }
            (Patch::Reminder(p), StoredDocument::Reminder(r)) => {
                if let Some(message) = &p.message {
                    r.message = message.clone();
                }
                if let Some(time) = p.reminder_time {
                    r.reminder_time = time;
                }
                if let Some(is_sent) = p.is_sent {
                    r.is_sent = is_sent;
                }
                if let Some(is_done) = p.is_done {
                    r.is_done = is_done;
                }
                if let Some(note_id) = &p.note_id {
                    r.note_id = note_id.clone();
                }
                if let Some(note_title) = &p.note_title {
                    r.note_title = note_title.clone();
                }
                if let Some(flag_ids) = &p.flag_ids {
                    r.flag_ids = flag_ids.clone();
                }
            }
            _ => {
                return Err(StoreError::PatchMismatch {
                    key: key.to_string(),
                    patch: self.name(),
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace.
    Put(StoredDocument),
    /// Patch an existing document; fails the batch if it is missing.
    Update { key: DocKey, patch: Patch },
    /// Remove; deleting a missing document is not an error.
    Delete(DocKey),
}

impl WriteOp {
    pub fn key(&self) -> DocKey {
        match self {
            WriteOp::Put(doc) => doc.key(),
            WriteOp::Update { key, .. } | WriteOp::Delete(key) => key.clone(),
        }
    }
}

/// Multi-document write applied all-or-nothing by `DocumentStore::commit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, doc: StoredDocument) -> &mut Self {
        self.ops.push(WriteOp::Put(doc));
        self
    }

    pub fn update(&mut self, key: DocKey, patch: Patch) -> &mut Self {
        self.ops.push(WriteOp::Update { key, patch });
        self
    }

    pub fn delete(&mut self, key: DocKey) -> &mut Self {
        self.ops.push(WriteOp::Delete(key));
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Field queries across the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Every user's grant for a note.
    GrantsForNote(String),
    /// All grants held by a user.
    GrantsForUser(String),
    /// Notes whose `parentNoteId` is the given note.
    ChildNotes(String),
    /// Unsent reminders due at or before the instant.
    RemindersDue { before: DateTime<Utc> },
    RemindersForUser(String),
    FlagsForUser(String),
}

impl Query {
    pub fn matches(&self, doc: &StoredDocument) -> bool {
        match (self, doc) {
            (Query::GrantsForNote(id), StoredDocument::AccessGrant(g)) => g.note_id == *id,
            (Query::GrantsForUser(id), StoredDocument::AccessGrant(g)) => g.user_id == *id,
            (Query::ChildNotes(id), StoredDocument::Note(n)) => {
                n.parent_note_id.as_deref() == Some(id.as_str())
            }
            (Query::RemindersDue { before }, StoredDocument::Reminder(r)) => {
                !r.is_sent && r.reminder_time <= *before
            }
            (Query::RemindersForUser(id), StoredDocument::Reminder(r)) => r.user_id == *id,
            (Query::FlagsForUser(id), StoredDocument::Flag(f)) => f.user_id == *id,
            _ => false,
        }
    }
}

/// Keys written by one successful `put` or `commit`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub keys: Vec<DocKey>,
}

/// Durable document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a single document.
    async fn get(&self, key: &DocKey) -> Result<Option<StoredDocument>>;

    /// Create or replace a single document.
    async fn put(&self, doc: StoredDocument) -> Result<()>;

    /// Patch a single document.
    async fn update(&self, key: &DocKey, patch: Patch) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.update(key.clone(), patch);
        self.commit(batch).await
    }

    /// Apply every operation or none.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Exact-match query.
    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>>;

    /// Feed of committed changes.
    fn watch(&self) -> broadcast::Receiver<StoreChange>;
}

/// Push-on-change query: yields the current results, then new results each
/// time a committed change alters them.
pub fn live_query(
    store: Arc<dyn DocumentStore>,
    query: Query,
) -> impl Stream<Item = Result<Vec<StoredDocument>>> + Send + 'static {
    let changes = store.watch();
    stream::unfold(
        (store, query, changes, None::<Vec<StoredDocument>>),
        |(store, query, mut changes, last)| async move {
            if last.is_some() {
                loop {
                    match changes.recv().await {
                        Ok(change) if !change.keys.is_empty() => break,
                        Ok(_) => continue,
                        // Missed some changes: re-run the query anyway
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }

            loop {
                match store.query(&query).await {
                    Ok(results) if last.as_ref() == Some(&results) => {
                        // Unrelated change; wait for the next one
                        match changes.recv().await {
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                    Ok(results) => {
                        let next = Some(results.clone());
                        return Some((Ok(results), (store, query, changes, next)));
                    }
                    Err(e) => return Some((Err(e), (store, query, changes, last))),
                }
            }
        },
    )
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    /// Fail the next commit after staging this many operations.
    fail_commit_after: Option<usize>,
}

/// In-memory store for testing.
pub struct InMemoryStore {
    docs: RwLock<BTreeMap<DocKey, StoredDocument>>,
    faults: Mutex<Faults>,
    changes: broadcast::Sender<StoreChange>,
    writes: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            docs: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            changes,
            writes: AtomicUsize::new(0),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock_faults().unavailable = unavailable;
    }

    /// Make the next commit fail after staging `ops` of its operations.
    pub fn fail_next_commit_after(&self, ops: usize) {
        self.lock_faults().fail_commit_after = Some(ops);
    }

    /// Number of successful writes (puts and commits).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored document.
    pub fn all(&self) -> Vec<StoredDocument> {
        self.read_docs().values().cloned().collect()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_docs(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DocKey, StoredDocument>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.lock_faults().unavailable {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn publish(&self, keys: Vec<DocKey>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine
        let _ = self.changes.send(StoreChange { keys });
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, key: &DocKey) -> Result<Option<StoredDocument>> {
        self.check_available()?;
        let doc = self.read_docs().get(key).cloned();
        if let Some(doc) = &doc {
            doc.validate().map_err(StoreError::Invalid)?;
        }
        Ok(doc)
    }

    async fn put(&self, doc: StoredDocument) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(doc);
        self.commit(batch).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.check_available()?;
        let fail_after = self.lock_faults().fail_commit_after.take();

        let keys: Vec<DocKey> = batch.ops.iter().map(WriteOp::key).collect();
        {
            let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
            // Stage against a copy; only swap in when every op succeeded
            let mut staged = docs.clone();

            for (applied, op) in batch.ops.into_iter().enumerate() {
                if fail_after == Some(applied) {
                    debug!("Injected failure after {} staged ops", applied);
                    return Err(StoreError::Unavailable(format!(
                        "injected failure after {applied} operations"
                    )));
                }
                match op {
                    WriteOp::Put(doc) => {
                        doc.validate().map_err(StoreError::Invalid)?;
                        staged.insert(doc.key(), doc);
                    }
                    WriteOp::Update { key, patch } => {
                        let doc = staged
                            .get_mut(&key)
                            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
                        patch.apply(&key, doc)?;
                    }
                    WriteOp::Delete(key) => {
                        staged.remove(&key);
                    }
                }
            }

            *docs = staged;
        }

        self.publish(keys);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>> {
        self.check_available()?;
        Ok(self
            .read_docs()
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessGrant, Note, Role};
    use futures::StreamExt;

    fn note(id: &str, parent: Option<&str>) -> StoredDocument {
        let now = Utc::now();
        StoredDocument::Note(Note {
            id: id.into(),
            title: "New Note".into(),
            parent_note_id: parent.map(Into::into),
            content: String::new(),
            crdt_state: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn grant(user: &str, note: &str) -> StoredDocument {
        let now = Utc::now();
        StoredDocument::AccessGrant(AccessGrant {
            user_id: user.into(),
            note_id: note.into(),
            role: Role::Owner,
            title: "New Note".into(),
            parent_note_id: None,
            icon: String::new(),
            cover_image: String::new(),
            archived: false,
            quick_access: false,
            created_at: now,
            updated_at: now,
        })
    }

    fn archive(user: &str, note: &str) -> (DocKey, Patch) {
        (
            DocKey::grant(user, note),
            Patch::Grant(GrantPatch {
                archived: Some(true),
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_put_get_query() {
        let store = InMemoryStore::new();
        store.put(note("n1", None)).await.unwrap();
        store.put(note("n2", Some("n1"))).await.unwrap();
        store.put(grant("a@x", "n1")).await.unwrap();

        assert!(store.get(&DocKey::Note("n1".into())).await.unwrap().is_some());
        assert!(store.get(&DocKey::Note("zz".into())).await.unwrap().is_none());

        let children = store.query(&Query::ChildNotes("n1".into())).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].key(), DocKey::Note("n2".into()));

        let grants = store.query(&Query::GrantsForNote("n1".into())).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_commit_is_atomic_on_injected_failure() {
        let store = InMemoryStore::new();
        for n in ["n1", "n2", "n3"] {
            store.put(grant("a@x", n)).await.unwrap();
        }

        let mut batch = WriteBatch::new();
        for n in ["n1", "n2", "n3"] {
            let (key, patch) = archive("a@x", n);
            batch.update(key, patch);
        }
        store.fail_next_commit_after(2);
        assert!(store.commit(batch.clone()).await.is_err());

        let archived = store
            .query(&Query::GrantsForUser("a@x".into()))
            .await
            .unwrap()
            .iter()
            .filter(|d| d.as_grant().is_some_and(|g| g.archived))
            .count();
        assert_eq!(archived, 0);

        // Fault is one-shot
        store.commit(batch).await.unwrap();
        let grants = store.query(&Query::GrantsForUser("a@x".into())).await.unwrap();
        assert!(grants.iter().all(|d| d.as_grant().is_some_and(|g| g.archived)));
    }

    #[tokio::test]
    async fn test_update_missing_fails_whole_batch() {
        let store = InMemoryStore::new();
        store.put(grant("a@x", "n1")).await.unwrap();

        let mut batch = WriteBatch::new();
        let (key, patch) = archive("a@x", "n1");
        batch.update(key, patch);
        let (key, patch) = archive("a@x", "missing");
        batch.update(key, patch);

        assert!(matches!(
            store.commit(batch).await,
            Err(StoreError::NotFound(_))
        ));
        let g = store.get(&DocKey::grant("a@x", "n1")).await.unwrap().unwrap();
        assert!(!g.as_grant().unwrap().archived);
    }

    #[tokio::test]
    async fn test_patch_kind_mismatch() {
        let store = InMemoryStore::new();
        store.put(note("n1", None)).await.unwrap();
        let err = store
            .update(&DocKey::Note("n1".into()), Patch::Grant(GrantPatch::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PatchMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.put(note("n1", None)).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        store.put(note("n1", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_document_rejected() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.put(note("", None)).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_live_query_pushes_changes() {
        let store = Arc::new(InMemoryStore::new());
        let mut live = Box::pin(live_query(
            store.clone() as Arc<dyn DocumentStore>,
            Query::ChildNotes("root".into()),
        ));

        assert!(live.next().await.unwrap().unwrap().is_empty());

        // Unrelated write does not produce an item; the matching one does
        store.put(note("other", None)).await.unwrap();
        store.put(note("child", Some("root"))).await.unwrap();

        let results = live.next().await.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key(), DocKey::Note("child".into()));
    }
}
