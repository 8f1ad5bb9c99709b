//! Note and access-grant actions.
//!
//! Note-level view state (title, icon, cover, archived) is mirrored onto every
//! user's grant so listings are a single query per user. Mutations touching
//! more than one document go through one atomic `WriteBatch`.
//!
//! Deleting a note deletes all of its descendants and every grant on them.

use crate::config::CollabConfig;
use crate::error::{ActionError, ActionResult, Caller};
use crate::model::{AccessGrant, DocKey, Note, Role, StoredDocument, DEFAULT_NOTE_TITLE};
use crate::store::{DocumentStore, GrantPatch, NotePatch, Patch, Query, WriteBatch};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Result<T> = std::result::Result<T, ActionError>;

/// A user's visible notes, split by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteListing {
    pub owned: Vec<AccessGrant>,
    pub shared: Vec<AccessGrant>,
}

pub struct NoteActions {
    store: Arc<dyn DocumentStore>,
    max_depth: usize,
}

impl NoteActions {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CollabConfig) -> Self {
        Self {
            store,
            max_depth: config.max_tree_depth,
        }
    }

    /// Create a note owned by the caller, optionally under `parent`.
    pub async fn create_note(&self, caller: &Caller, parent: Option<&str>) -> ActionResult<String> {
        self.try_create_note(caller, parent).await.into()
    }

    async fn try_create_note(&self, caller: &Caller, parent: Option<&str>) -> Result<String> {
        let user = caller.require()?;
        if let Some(parent) = parent {
            self.note(parent).await?;
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let parent_note_id = parent.map(str::to_string);

        let mut batch = WriteBatch::new();
        batch
            .put(StoredDocument::Note(Note {
                id: id.clone(),
                title: DEFAULT_NOTE_TITLE.to_string(),
                parent_note_id: parent_note_id.clone(),
                content: String::new(),
                crdt_state: None,
                created_at: now,
                updated_at: now,
            }))
            .put(StoredDocument::AccessGrant(AccessGrant {
                user_id: user.to_string(),
                note_id: id.clone(),
                role: Role::Owner,
                title: DEFAULT_NOTE_TITLE.to_string(),
                parent_note_id,
                icon: String::new(),
                cover_image: String::new(),
                archived: false,
                quick_access: false,
                created_at: now,
                updated_at: now,
            }));
        self.store.commit(batch).await?;

        info!("{} created note {}", user, id);
        Ok(id)
    }

    /// Give `email` editor access, cloning the owner's view of the note.
    pub async fn invite_user(&self, caller: &Caller, note_id: &str, email: &str) -> ActionResult<()> {
        self.try_invite_user(caller, note_id, email).await.into()
    }

    async fn try_invite_user(&self, caller: &Caller, note_id: &str, email: &str) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;

        let email = email.trim();
        if email.is_empty() {
            return Err(ActionError::InvalidInput("email is required".into()));
        }
        if self.store.get(&DocKey::grant(email, note_id)).await?.is_some() {
            return Err(ActionError::InvalidInput(format!(
                "{email} already has access to {note_id}"
            )));
        }

        let owner = self
            .grants(note_id)
            .await?
            .into_iter()
            .find(|g| g.role == Role::Owner)
            .ok_or_else(|| ActionError::NotFound(format!("owner grant for {note_id}")))?;

        let now = Utc::now();
        let grant = AccessGrant {
            user_id: email.to_string(),
            role: Role::Editor,
            quick_access: false,
            created_at: now,
            updated_at: now,
            ..owner
        };
        self.store.put(StoredDocument::AccessGrant(grant)).await?;

        info!("{} invited {} to {}", user, email, note_id);
        Ok(())
    }

    /// Revoke a user's access. The owner's grant cannot be removed.
    pub async fn remove_user(&self, caller: &Caller, note_id: &str, email: &str) -> ActionResult<()> {
        self.try_remove_user(caller, note_id, email).await.into()
    }

    async fn try_remove_user(&self, caller: &Caller, note_id: &str, email: &str) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;

        let target = self.require_grant(email, note_id).await?;
        if target.role == Role::Owner {
            return Err(ActionError::InvalidInput("the owner cannot be removed".into()));
        }

        let mut batch = WriteBatch::new();
        batch.delete(DocKey::grant(email, note_id));
        self.store.commit(batch).await?;
        info!("{} removed {} from {}", user, email, note_id);
        Ok(())
    }

    /// Set the title on the note and on every grant.
    pub async fn rename_note(&self, caller: &Caller, note_id: &str, title: &str) -> ActionResult<()> {
        self.try_rename_note(caller, note_id, title).await.into()
    }

    async fn try_rename_note(&self, caller: &Caller, note_id: &str, title: &str) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;

        let mut batch = WriteBatch::new();
        batch.update(
            DocKey::Note(note_id.to_string()),
            Patch::Note(NotePatch {
                title: Some(title.to_string()),
                ..Default::default()
            }),
        );
        self.patch_grants(
            &mut batch,
            &[note_id.to_string()],
            GrantPatch {
                title: Some(title.to_string()),
                ..Default::default()
            },
        )
        .await?;
        self.store.commit(batch).await?;
        Ok(())
    }

    /// Move a note and all its descendants to the trash.
    pub async fn archive_note(&self, caller: &Caller, note_id: &str) -> ActionResult<()> {
        self.set_archived(caller, note_id, true).await.into()
    }

    /// Bring a note and all its descendants back from the trash.
    pub async fn restore_note(&self, caller: &Caller, note_id: &str) -> ActionResult<()> {
        self.set_archived(caller, note_id, false).await.into()
    }

    async fn set_archived(&self, caller: &Caller, note_id: &str, archived: bool) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;

        let mut notes = vec![note_id.to_string()];
        notes.extend(self.descendants(note_id).await?);

        let mut batch = WriteBatch::new();
        self.patch_grants(
            &mut batch,
            &notes,
            GrantPatch {
                archived: Some(archived),
                ..Default::default()
            },
        )
        .await?;
        self.store.commit(batch).await?;

        info!(
            "{} {} note {} ({} notes)",
            user,
            if archived { "archived" } else { "restored" },
            note_id,
            notes.len()
        );
        Ok(())
    }

    /// Delete a note, its descendants and every grant on them. Owner only.
    pub async fn delete_note(&self, caller: &Caller, note_id: &str) -> ActionResult<()> {
        self.try_delete_note(caller, note_id).await.into()
    }

    async fn try_delete_note(&self, caller: &Caller, note_id: &str) -> Result<()> {
        let user = caller.require()?;
        let grant = self.require_grant(user, note_id).await?;
        if grant.role != Role::Owner {
            return Err(ActionError::InvalidInput("only the owner can delete a note".into()));
        }

        let mut notes = vec![note_id.to_string()];
        notes.extend(self.descendants(note_id).await?);

        let mut batch = WriteBatch::new();
        for id in &notes {
            batch.delete(DocKey::Note(id.clone()));
            for g in self.grants(id).await? {
                batch.delete(DocKey::grant(&g.user_id, &g.note_id));
            }
        }
        self.store.commit(batch).await?;

        info!("{} deleted note {} and {} descendants", user, note_id, notes.len() - 1);
        Ok(())
    }

    pub async fn set_icon(&self, caller: &Caller, note_id: &str, icon: &str) -> ActionResult<()> {
        let patch = GrantPatch {
            icon: Some(icon.to_string()),
            ..Default::default()
        };
        self.patch_note_grants(caller, note_id, patch).await.into()
    }

    pub async fn remove_icon(&self, caller: &Caller, note_id: &str) -> ActionResult<()> {
        self.set_icon(caller, note_id, "").await
    }

    pub async fn set_cover(&self, caller: &Caller, note_id: &str, url: &str) -> ActionResult<()> {
        let patch = GrantPatch {
            cover_image: Some(url.to_string()),
            ..Default::default()
        };
        self.patch_note_grants(caller, note_id, patch).await.into()
    }

    pub async fn remove_cover(&self, caller: &Caller, note_id: &str) -> ActionResult<()> {
        self.set_cover(caller, note_id, "").await
    }

    /// Pin or unpin a note for the caller only.
    pub async fn set_quick_access(&self, caller: &Caller, note_id: &str, pinned: bool) -> ActionResult<()> {
        self.try_set_quick_access(caller, note_id, pinned).await.into()
    }

    async fn try_set_quick_access(&self, caller: &Caller, note_id: &str, pinned: bool) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;
        self.store
            .update(
                &DocKey::grant(user, note_id),
                Patch::Grant(GrantPatch {
                    quick_access: Some(pinned),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Non-archived notes of the caller, grouped by role.
    pub async fn list_notes(&self, caller: &Caller) -> ActionResult<NoteListing> {
        self.try_list_notes(caller).await.into()
    }

    async fn try_list_notes(&self, caller: &Caller) -> Result<NoteListing> {
        let user = caller.require()?;
        let mut listing = NoteListing::default();
        for grant in self.user_grants(user).await?.into_iter().filter(|g| !g.archived) {
            match grant.role {
                Role::Owner => listing.owned.push(grant),
                Role::Editor => listing.shared.push(grant),
            }
        }
        Ok(listing)
    }

    /// Archived notes of the caller.
    pub async fn list_trash(&self, caller: &Caller) -> ActionResult<Vec<AccessGrant>> {
        self.filtered_grants(caller, |g| g.archived).await.into()
    }

    /// Pinned, non-archived notes of the caller.
    pub async fn quick_access_notes(&self, caller: &Caller) -> ActionResult<Vec<AccessGrant>> {
        self.filtered_grants(caller, |g| g.quick_access && !g.archived)
            .await
            .into()
    }

    /// Every note below `note_id`, breadth first.
    ///
    /// Stops at the configured depth and never visits a note twice, so a
    /// parent cycle in stored data cannot loop forever.
    pub async fn descendants(&self, note_id: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut visited = HashSet::from([note_id.to_string()]);
        let mut frontier = vec![note_id.to_string()];
        let mut depth = 0;

        while !frontier.is_empty() {
            if depth >= self.max_depth {
                warn!(
                    "Note {}: descendants deeper than {} levels ignored",
                    note_id, self.max_depth
                );
                break;
            }
            let mut next = Vec::new();
            for id in &frontier {
                for doc in self.store.query(&Query::ChildNotes(id.clone())).await? {
                    if let Some(child) = doc.as_note() {
                        if visited.insert(child.id.clone()) {
                            found.push(child.id.clone());
                            next.push(child.id.clone());
                        }
                    }
                }
            }
            frontier = next;
            depth += 1;
        }

        debug!("Note {} has {} descendants", note_id, found.len());
        Ok(found)
    }

    async fn note(&self, note_id: &str) -> Result<Note> {
        let key = DocKey::Note(note_id.to_string());
        self.store
            .get(&key)
            .await?
            .and_then(|doc| doc.as_note().cloned())
            .ok_or_else(|| ActionError::NotFound(key.to_string()))
    }

    async fn require_grant(&self, user: &str, note_id: &str) -> Result<AccessGrant> {
        let key = DocKey::grant(user, note_id);
        self.store
            .get(&key)
            .await?
            .and_then(|doc| doc.as_grant().cloned())
            .ok_or_else(|| ActionError::NotFound(key.to_string()))
    }

    async fn grants(&self, note_id: &str) -> Result<Vec<AccessGrant>> {
        Ok(self
            .store
            .query(&Query::GrantsForNote(note_id.to_string()))
            .await?
            .iter()
            .filter_map(StoredDocument::as_grant)
            .cloned()
            .collect())
    }

    async fn user_grants(&self, user: &str) -> Result<Vec<AccessGrant>> {
        let mut grants: Vec<AccessGrant> = self
            .store
            .query(&Query::GrantsForUser(user.to_string()))
            .await?
            .iter()
            .filter_map(StoredDocument::as_grant)
            .cloned()
            .collect();
        grants.sort_by_key(|g| g.created_at);
        Ok(grants)
    }

    async fn filtered_grants(
        &self,
        caller: &Caller,
        keep: impl Fn(&AccessGrant) -> bool,
    ) -> Result<Vec<AccessGrant>> {
        let user = caller.require()?;
        Ok(self
            .user_grants(user)
            .await?
            .into_iter()
            .filter(|g| keep(g))
            .collect())
    }

    /// Add an update of every grant on `notes` to `batch`.
    async fn patch_grants(&self, batch: &mut WriteBatch, notes: &[String], patch: GrantPatch) -> Result<()> {
        for id in notes {
            for g in self.grants(id).await? {
                batch.update(DocKey::grant(&g.user_id, &g.note_id), Patch::Grant(patch.clone()));
            }
        }
        Ok(())
    }

    async fn patch_note_grants(&self, caller: &Caller, note_id: &str, patch: GrantPatch) -> Result<()> {
        let user = caller.require()?;
        self.require_grant(user, note_id).await?;
        let mut batch = WriteBatch::new();
        self.patch_grants(&mut batch, &[note_id.to_string()], patch).await?;
        self.store.commit(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn actions() -> (Arc<InMemoryStore>, NoteActions) {
        let store = Arc::new(InMemoryStore::new());
        let actions = NoteActions::new(store.clone(), &CollabConfig::default());
        (store, actions)
    }

    async fn grant(store: &InMemoryStore, user: &str, note: &str) -> AccessGrant {
        store
            .get(&DocKey::grant(user, note))
            .await
            .unwrap()
            .unwrap()
            .as_grant()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_requires_auth() {
        let (_, actions) = actions();
        let result = actions.create_note(&Caller::anonymous(), None).await;
        assert_eq!(result.error, Some(ActionError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_create_under_missing_parent() {
        let (_, actions) = actions();
        let result = actions
            .create_note(&Caller::authenticated("a@x"), Some("nope"))
            .await;
        assert!(matches!(result.error, Some(ActionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_writes_note_and_owner_grant() {
        let (store, actions) = actions();
        let alice = Caller::authenticated("a@x");
        let id = actions.create_note(&alice, None).await.into_result().unwrap();

        let g = grant(&store, "a@x", &id).await;
        assert_eq!(g.role, Role::Owner);
        assert_eq!(g.title, DEFAULT_NOTE_TITLE);
        assert!(!g.archived);
        // One atomic commit
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_invite_clones_owner_view() {
        let (store, actions) = actions();
        let alice = Caller::authenticated("a@x");
        let id = actions.create_note(&alice, None).await.into_result().unwrap();
        actions.set_icon(&alice, &id, "🚀").await.into_result().unwrap();
        actions.set_quick_access(&alice, &id, true).await.into_result().unwrap();

        actions.invite_user(&alice, &id, "b@x").await.into_result().unwrap();
        let g = grant(&store, "b@x", &id).await;
        assert_eq!(g.role, Role::Editor);
        assert_eq!(g.icon, "🚀");
        assert!(!g.quick_access);

        let again = actions.invite_user(&alice, &id, "b@x").await;
        assert!(matches!(again.error, Some(ActionError::InvalidInput(_))));

        let bob = Caller::authenticated("b@x");
        let listing = actions.list_notes(&bob).await.into_result().unwrap();
        assert_eq!(listing.shared.len(), 1);
        assert!(listing.owned.is_empty());

        actions.remove_user(&alice, &id, "b@x").await.into_result().unwrap();
        let listing = actions.list_notes(&bob).await.into_result().unwrap();
        assert!(listing.shared.is_empty());

        let owner_removal = actions.remove_user(&alice, &id, "a@x").await;
        assert!(!owner_removal.success);
    }

    #[tokio::test]
    async fn test_rename_mirrors_onto_grants() {
        let (store, actions) = actions();
        let alice = Caller::authenticated("a@x");
        let id = actions.create_note(&alice, None).await.into_result().unwrap();
        actions.invite_user(&alice, &id, "b@x").await.into_result().unwrap();

        actions.rename_note(&alice, &id, "Plans").await.into_result().unwrap();
        assert_eq!(grant(&store, "a@x", &id).await.title, "Plans");
        assert_eq!(grant(&store, "b@x", &id).await.title, "Plans");
        let note = actions.note(&id).await.unwrap();
        assert_eq!(note.title, "Plans");
    }

    #[tokio::test]
    async fn test_descendants_are_collected_iteratively() {
        let (_, actions) = actions();
        let alice = Caller::authenticated("a@x");
        let root = actions.create_note(&alice, None).await.into_result().unwrap();
        let child = actions.create_note(&alice, Some(&root)).await.into_result().unwrap();
        let grandchild = actions.create_note(&alice, Some(&child)).await.into_result().unwrap();
        let sibling = actions.create_note(&alice, Some(&root)).await.into_result().unwrap();

        let mut found = actions.descendants(&root).await.unwrap();
        found.sort();
        let mut expected = vec![child, grandchild.clone(), sibling];
        expected.sort();
        assert_eq!(found, expected);
        assert!(actions.descendants(&grandchild).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_descendants_respect_depth_cap() {
        let store = Arc::new(InMemoryStore::new());
        let config = CollabConfig {
            max_tree_depth: 2,
            ..Default::default()
        };
        let actions = NoteActions::new(store.clone(), &config);
        let alice = Caller::authenticated("a@x");

        let mut parent = actions.create_note(&alice, None).await.into_result().unwrap();
        let root = parent.clone();
        for _ in 0..4 {
            parent = actions
                .create_note(&alice, Some(&parent))
                .await
                .into_result()
                .unwrap();
        }
        assert_eq!(actions.descendants(&root).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, actions) = actions();
        let alice = Caller::authenticated("a@x");
        let root = actions.create_note(&alice, None).await.into_result().unwrap();
        let child = actions.create_note(&alice, Some(&root)).await.into_result().unwrap();
        actions.invite_user(&alice, &child, "b@x").await.into_result().unwrap();

        let bob = Caller::authenticated("b@x");
        let denied = actions.delete_note(&bob, &child).await;
        assert!(matches!(denied.error, Some(ActionError::InvalidInput(_))));

        actions.delete_note(&alice, &root).await.into_result().unwrap();
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_reported_not_raised() {
        let (store, actions) = actions();
        store.set_unavailable(true);
        let result = actions.create_note(&Caller::authenticated("a@x"), None).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(ActionError::TransientStoreFailure(_))));
    }
}
