//! Durable document schema.
//!
//! Every document in the store is one variant of `StoredDocument`, tagged by
//! `kind` in its JSON form and validated when decoded at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Title given to freshly created notes.
pub const DEFAULT_NOTE_TITLE: &str = "New Note";

/// A note: identity, hierarchy and durable body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub parent_note_id: Option<String>,
    /// Flattened body markup.
    #[serde(default)]
    pub content: String,
    /// Loro snapshot of the body, when a session has flushed one.
    #[serde(default)]
    pub crdt_state: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
}

/// Membership of one user in one note, with that user's view state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub user_id: String,
    pub note_id: String,
    pub role: Role,
    pub title: String,
    pub parent_note_id: Option<String>,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub cover_image: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub quick_access: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub reminder_time: DateTime<Utc>,
    #[serde(default)]
    pub is_sent: bool,
    #[serde(default)]
    pub is_done: bool,
    pub note_id: Option<String>,
    pub note_title: Option<String>,
    #[serde(default)]
    pub flag_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// User-defined label attached to reminders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub color: String,
}

/// A push subscription registered by one of the user's devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTarget {
    pub endpoint: String,
    #[serde(default)]
    pub p256dh: String,
    #[serde(default)]
    pub auth: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub push_targets: Vec<PushTarget>,
}

/// Address of a document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum DocKey {
    Note(String),
    Grant { user_id: String, note_id: String },
    Reminder(String),
    Flag(String),
    User(String),
}

impl DocKey {
    pub fn grant(user_id: &str, note_id: &str) -> Self {
        DocKey::Grant {
            user_id: user_id.to_string(),
            note_id: note_id.to_string(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Note(id) => write!(f, "notes/{id}"),
            DocKey::Grant { user_id, note_id } => write!(f, "users/{user_id}/rooms/{note_id}"),
            DocKey::Reminder(id) => write!(f, "reminders/{id}"),
            DocKey::Flag(id) => write!(f, "flags/{id}"),
            DocKey::User(id) => write!(f, "users/{id}"),
        }
    }
}

/// Any document the store holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoredDocument {
    Note(Note),
    AccessGrant(AccessGrant),
    Reminder(Reminder),
    Flag(Flag),
    UserProfile(UserProfile),
}

impl StoredDocument {
    pub fn key(&self) -> DocKey {
        match self {
            StoredDocument::Note(n) => DocKey::Note(n.id.clone()),
            StoredDocument::AccessGrant(g) => DocKey::grant(&g.user_id, &g.note_id),
            StoredDocument::Reminder(r) => DocKey::Reminder(r.id.clone()),
            StoredDocument::Flag(f) => DocKey::Flag(f.id.clone()),
            StoredDocument::UserProfile(u) => DocKey::User(u.user_id.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoredDocument::Note(_) => "note",
            StoredDocument::AccessGrant(_) => "accessGrant",
            StoredDocument::Reminder(_) => "reminder",
            StoredDocument::Flag(_) => "flag",
            StoredDocument::UserProfile(_) => "userProfile",
        }
    }

    /// Structural checks applied whenever a document enters or leaves the store.
    pub fn validate(&self) -> Result<(), String> {
        let require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                Err(format!("{} has an empty {}", self.kind(), field))
            } else {
                Ok(())
            }
        };

        match self {
            StoredDocument::Note(n) => {
                require(&n.id, "id")?;
                if n.parent_note_id.as_deref() == Some(n.id.as_str()) {
                    return Err(format!("note {} is its own parent", n.id));
                }
                Ok(())
            }
            StoredDocument::AccessGrant(g) => {
                require(&g.user_id, "userId")?;
                require(&g.note_id, "noteId")
            }
            StoredDocument::Reminder(r) => {
                require(&r.id, "id")?;
                require(&r.user_id, "userId")?;
                require(&r.message, "message")
            }
            StoredDocument::Flag(f) => {
                require(&f.id, "id")?;
                require(&f.name, "name")
            }
            StoredDocument::UserProfile(u) => require(&u.user_id, "userId"),
        }
    }

    pub fn as_note(&self) -> Option<&Note> {
        match self {
            StoredDocument::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_grant(&self) -> Option<&AccessGrant> {
        match self {
            StoredDocument::AccessGrant(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_reminder(&self) -> Option<&Reminder> {
        match self {
            StoredDocument::Reminder(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<&Flag> {
        match self {
            StoredDocument::Flag(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserProfile> {
        match self {
            StoredDocument::UserProfile(u) => Some(u),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, parent: Option<&str>) -> StoredDocument {
        let now = Utc::now();
        StoredDocument::Note(Note {
            id: id.to_string(),
            title: DEFAULT_NOTE_TITLE.to_string(),
            parent_note_id: parent.map(str::to_string),
            content: String::new(),
            crdt_state: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[test]
    fn test_json_is_tagged() {
        let json = serde_json::to_value(note("n1", None)).unwrap();
        assert_eq!(json["kind"], "note");
        assert_eq!(json["title"], "New Note");
        assert!(json["parentNoteId"].is_null());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let result: Result<StoredDocument, _> =
            serde_json::from_str(r#"{"kind":"room","id":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_grant_defaults_on_decode() {
        let json = r#"{
            "kind": "accessGrant",
            "userId": "a@x",
            "noteId": "n1",
            "role": "owner",
            "title": "New Note",
            "parentNoteId": null,
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z"
        }"#;
        let doc: StoredDocument = serde_json::from_str(json).unwrap();
        let grant = doc.as_grant().unwrap();
        assert!(!grant.archived);
        assert_eq!(grant.icon, "");
        assert_eq!(doc.key(), DocKey::grant("a@x", "n1"));
    }

    #[test]
    fn test_validate() {
        assert!(note("n1", None).validate().is_ok());
        assert!(note("", None).validate().is_err());
        assert!(note("n1", Some("n1")).validate().is_err());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(DocKey::grant("a@x", "n1").to_string(), "users/a@x/rooms/n1");
        assert_eq!(DocKey::Note("n1".into()).to_string(), "notes/n1");
    }
}
