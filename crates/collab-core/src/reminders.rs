//! Reminders, flags and the due-reminder sweep.
//!
//! A reminder is marked sent only after delivery to the owner's devices was
//! attempted, and editing it clears the mark so it is delivered again.

use crate::config::CollabConfig;
use crate::error::{ActionError, ActionResult, Caller};
use crate::model::{DocKey, Flag, PushTarget, Reminder, StoredDocument, UserProfile};
use crate::store::{DocumentStore, Patch, Query, ReminderPatch, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Result<T> = std::result::Result<T, ActionError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    /// The subscription no longer exists on the push service.
    #[error("Push target expired: {0}")]
    Expired(String),

    #[error("Push delivery failed: {0}")]
    Failed(String),
}

/// Notification shown on the user's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

/// Push notification service.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn deliver(&self, target: &PushTarget, payload: &PushPayload) -> std::result::Result<(), DeliveryError>;
}

/// Fields a user sets when scheduling or editing a reminder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderDraft {
    pub message: String,
    pub reminder_time: DateTime<Utc>,
    #[serde(default)]
    pub note_id: Option<String>,
    #[serde(default)]
    pub note_title: Option<String>,
    #[serde(default)]
    pub flag_ids: Vec<String>,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Reminders marked sent.
    pub sent: usize,
    /// Due reminders left unsent because their owner has no push targets.
    pub skipped: usize,
    /// Individual device deliveries that failed.
    pub failed_deliveries: usize,
    /// Push targets removed because the push service reported them expired.
    pub pruned_targets: usize,
}

pub struct ReminderActions {
    store: Arc<dyn DocumentStore>,
    app_url: String,
}

impl ReminderActions {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CollabConfig) -> Self {
        Self {
            store,
            app_url: config.app_url.clone(),
        }
    }

    pub async fn schedule_reminder(&self, caller: &Caller, draft: ReminderDraft) -> ActionResult<String> {
        self.try_schedule(caller, draft).await.into()
    }

    async fn try_schedule(&self, caller: &Caller, draft: ReminderDraft) -> Result<String> {
        let user = caller.require()?;
        validate_draft(&draft, Utc::now())?;
        self.check_flags(user, &draft.flag_ids).await?;

        let id = Uuid::new_v4().to_string();
        self.store
            .put(StoredDocument::Reminder(Reminder {
                id: id.clone(),
                user_id: user.to_string(),
                message: draft.message.trim().to_string(),
                reminder_time: draft.reminder_time,
                is_sent: false,
                is_done: false,
                note_id: draft.note_id,
                note_title: draft.note_title,
                flag_ids: draft.flag_ids,
                created_at: Utc::now(),
            }))
            .await?;

        info!("{} scheduled reminder {} for {}", user, id, draft.reminder_time);
        Ok(id)
    }

    /// Replace a reminder's fields. Clears `is_sent` so it fires again.
    pub async fn update_reminder(&self, caller: &Caller, id: &str, draft: ReminderDraft) -> ActionResult<()> {
        self.try_update(caller, id, draft).await.into()
    }

    async fn try_update(&self, caller: &Caller, id: &str, draft: ReminderDraft) -> Result<()> {
        let user = caller.require()?;
        self.owned_reminder(user, id).await?;
        validate_draft(&draft, Utc::now())?;
        self.check_flags(user, &draft.flag_ids).await?;

        self.store
            .update(
                &DocKey::Reminder(id.to_string()),
                Patch::Reminder(ReminderPatch {
                    message: Some(draft.message.trim().to_string()),
                    reminder_time: Some(draft.reminder_time),
                    is_sent: Some(false),
                    note_id: Some(draft.note_id),
                    note_title: Some(draft.note_title),
                    flag_ids: Some(draft.flag_ids),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_reminder(&self, caller: &Caller, id: &str) -> ActionResult<()> {
        self.try_delete(caller, id).await.into()
    }

    async fn try_delete(&self, caller: &Caller, id: &str) -> Result<()> {
        let user = caller.require()?;
        self.owned_reminder(user, id).await?;
        let mut batch = WriteBatch::new();
        batch.delete(DocKey::Reminder(id.to_string()));
        self.store.commit(batch).await?;
        Ok(())
    }

    /// The caller's reminders, soonest first.
    pub async fn list_reminders(&self, caller: &Caller) -> ActionResult<Vec<Reminder>> {
        self.try_list(caller).await.into()
    }

    async fn try_list(&self, caller: &Caller) -> Result<Vec<Reminder>> {
        let user = caller.require()?;
        let mut reminders: Vec<Reminder> = self
            .store
            .query(&Query::RemindersForUser(user.to_string()))
            .await?
            .iter()
            .filter_map(StoredDocument::as_reminder)
            .cloned()
            .collect();
        reminders.sort_by_key(|r| r.reminder_time);
        Ok(reminders)
    }

    pub async fn set_reminder_done(&self, caller: &Caller, id: &str, done: bool) -> ActionResult<()> {
        let patch = ReminderPatch {
            is_done: Some(done),
            ..Default::default()
        };
        self.patch_owned(caller, id, patch).await.into()
    }

    pub async fn set_reminder_flags(&self, caller: &Caller, id: &str, flag_ids: Vec<String>) -> ActionResult<()> {
        self.try_set_flags(caller, id, flag_ids).await.into()
    }

    async fn try_set_flags(&self, caller: &Caller, id: &str, flag_ids: Vec<String>) -> Result<()> {
        let user = caller.require()?;
        self.check_flags(user, &flag_ids).await?;
        let patch = ReminderPatch {
            flag_ids: Some(flag_ids),
            ..Default::default()
        };
        self.patch_owned(caller, id, patch).await
    }

    pub async fn create_flag(&self, caller: &Caller, name: &str, color: &str) -> ActionResult<String> {
        self.try_create_flag(caller, name, color).await.into()
    }

    async fn try_create_flag(&self, caller: &Caller, name: &str, color: &str) -> Result<String> {
        let user = caller.require()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ActionError::InvalidInput("flag name is required".into()));
        }

        let id = Uuid::new_v4().to_string();
        self.store
            .put(StoredDocument::Flag(Flag {
                id: id.clone(),
                user_id: user.to_string(),
                name: name.to_string(),
                color: color.to_string(),
            }))
            .await?;
        Ok(id)
    }

    pub async fn list_flags(&self, caller: &Caller) -> ActionResult<Vec<Flag>> {
        self.try_list_flags(caller).await.into()
    }

    async fn try_list_flags(&self, caller: &Caller) -> Result<Vec<Flag>> {
        let user = caller.require()?;
        let mut flags = self.user_flags(user).await?;
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    /// Deliver every due, unsent reminder and mark it sent.
    ///
    /// Delivery failures are logged; the reminder still counts as attempted.
    /// Targets reported expired are dropped from their owner's profile in the
    /// same batch. Reminders whose owner has no push targets stay unsent for
    /// a later sweep.
    pub async fn sweep_due_reminders(&self, now: DateTime<Utc>, delivery: &dyn PushDelivery) -> ActionResult<SweepReport> {
        self.try_sweep(now, delivery).await.into()
    }

    async fn try_sweep(&self, now: DateTime<Utc>, delivery: &dyn PushDelivery) -> Result<SweepReport> {
        let due = self.store.query(&Query::RemindersDue { before: now }).await?;
        let mut report = SweepReport::default();
        let mut batch = WriteBatch::new();
        let mut expired: BTreeMap<String, HashSet<String>> = BTreeMap::new();

        for reminder in due.iter().filter_map(StoredDocument::as_reminder) {
            let gone = expired.entry(reminder.user_id.clone()).or_default();
            let targets: Vec<PushTarget> = self
                .push_targets(&reminder.user_id)
                .await?
                .into_iter()
                .filter(|t| !gone.contains(&t.endpoint))
                .collect();
            if targets.is_empty() {
                debug!("Reminder {}: {} has no push targets", reminder.id, reminder.user_id);
                report.skipped += 1;
                continue;
            }

            let payload = self.payload(reminder);
            for target in &targets {
                match delivery.deliver(target, &payload).await {
                    Ok(()) => {}
                    Err(DeliveryError::Expired(_)) => {
                        info!("Push target {} of {} expired", target.endpoint, reminder.user_id);
                        gone.insert(target.endpoint.clone());
                        report.failed_deliveries += 1;
                    }
                    Err(e) => {
                        warn!("Reminder {} to {}: {}", reminder.id, target.endpoint, e);
                        report.failed_deliveries += 1;
                    }
                }
            }

            batch.update(
                DocKey::Reminder(reminder.id.clone()),
                Patch::Reminder(ReminderPatch {
                    is_sent: Some(true),
                    ..Default::default()
                }),
            );
            report.sent += 1;
        }

        for (user_id, gone) in expired.into_iter().filter(|(_, gone)| !gone.is_empty()) {
            let push_targets: Vec<PushTarget> = self
                .push_targets(&user_id)
                .await?
                .into_iter()
                .filter(|t| !gone.contains(&t.endpoint))
                .collect();
            report.pruned_targets += gone.len();
            batch.put(StoredDocument::UserProfile(UserProfile {
                user_id,
                push_targets,
            }));
        }

        if !batch.is_empty() {
            self.store.commit(batch).await?;
        }
        info!(
            "Reminder sweep: {} sent, {} skipped, {} failed deliveries, {} targets pruned",
            report.sent, report.skipped, report.failed_deliveries, report.pruned_targets
        );
        Ok(report)
    }

    fn payload(&self, reminder: &Reminder) -> PushPayload {
        let title = match &reminder.note_title {
            Some(title) => format!("Reminder: {title}"),
            None => "You have a reminder!".to_string(),
        };
        let url = match &reminder.note_id {
            Some(id) => format!("{}/notes/{}", self.app_url, id),
            None => format!("{}/reminders", self.app_url),
        };
        PushPayload {
            title,
            body: reminder.message.clone(),
            url,
        }
    }

    async fn push_targets(&self, user: &str) -> Result<Vec<PushTarget>> {
        Ok(self
            .store
            .get(&DocKey::User(user.to_string()))
            .await?
            .and_then(|doc| doc.as_user().map(|u| u.push_targets.clone()))
            .unwrap_or_default())
    }

    async fn owned_reminder(&self, user: &str, id: &str) -> Result<Reminder> {
        let key = DocKey::Reminder(id.to_string());
        self.store
            .get(&key)
            .await?
            .and_then(|doc| doc.as_reminder().cloned())
            .filter(|r| r.user_id == user)
            .ok_or_else(|| ActionError::NotFound(key.to_string()))
    }

    async fn patch_owned(&self, caller: &Caller, id: &str, patch: ReminderPatch) -> Result<()> {
        let user = caller.require()?;
        self.owned_reminder(user, id).await?;
        self.store
            .update(&DocKey::Reminder(id.to_string()), Patch::Reminder(patch))
            .await?;
        Ok(())
    }

    async fn user_flags(&self, user: &str) -> Result<Vec<Flag>> {
        Ok(self
            .store
            .query(&Query::FlagsForUser(user.to_string()))
            .await?
            .iter()
            .filter_map(StoredDocument::as_flag)
            .cloned()
            .collect())
    }

    async fn check_flags(&self, user: &str, flag_ids: &[String]) -> Result<()> {
        if flag_ids.is_empty() {
            return Ok(());
        }
        let known: HashSet<String> = self.user_flags(user).await?.into_iter().map(|f| f.id).collect();
        match flag_ids.iter().find(|id| !known.contains(*id)) {
            Some(missing) => Err(ActionError::NotFound(DocKey::Flag(missing.clone()).to_string())),
            None => Ok(()),
        }
    }
}

fn validate_draft(draft: &ReminderDraft, now: DateTime<Utc>) -> Result<()> {
    if draft.message.trim().is_empty() {
        return Err(ActionError::InvalidInput("reminder message is required".into()));
    }
    if draft.reminder_time <= now {
        return Err(ActionError::InvalidInput("reminder time must be in the future".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(String, PushPayload)>>,
        failing_endpoint: Option<String>,
    }

    #[async_trait]
    impl PushDelivery for RecordingDelivery {
        async fn deliver(&self, target: &PushTarget, payload: &PushPayload) -> std::result::Result<(), DeliveryError> {
            if self.failing_endpoint.as_deref() == Some(target.endpoint.as_str()) {
                return Err(DeliveryError::Expired(target.endpoint.clone()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((target.endpoint.clone(), payload.clone()));
            Ok(())
        }
    }

    fn draft(message: &str, minutes: i64) -> ReminderDraft {
        ReminderDraft {
            message: message.into(),
            reminder_time: Utc::now() + Duration::minutes(minutes),
            note_id: None,
            note_title: None,
            flag_ids: vec![],
        }
    }

    fn setup() -> (Arc<InMemoryStore>, ReminderActions) {
        let store = Arc::new(InMemoryStore::new());
        let config = CollabConfig {
            app_url: "https://notes.example".into(),
            ..Default::default()
        };
        (store.clone(), ReminderActions::new(store, &config))
    }

    async fn register_device(store: &InMemoryStore, user: &str, endpoints: &[&str]) {
        store
            .put(StoredDocument::UserProfile(UserProfile {
                user_id: user.into(),
                push_targets: endpoints
                    .iter()
                    .map(|e| PushTarget {
                        endpoint: e.to_string(),
                        p256dh: String::new(),
                        auth: String::new(),
                    })
                    .collect(),
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_schedule_rejects_past_and_empty() {
        let (_, actions) = setup();
        let me = Caller::authenticated("a@x");
        let past = actions.schedule_reminder(&me, draft("late", -5)).await;
        assert!(matches!(past.error, Some(ActionError::InvalidInput(_))));
        let empty = actions.schedule_reminder(&me, draft("  ", 5)).await;
        assert!(matches!(empty.error, Some(ActionError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_list_sorted_and_scoped_to_owner() {
        let (_, actions) = setup();
        let me = Caller::authenticated("a@x");
        actions.schedule_reminder(&me, draft("later", 60)).await.into_result().unwrap();
        actions.schedule_reminder(&me, draft("sooner", 10)).await.into_result().unwrap();
        actions
            .schedule_reminder(&Caller::authenticated("b@x"), draft("theirs", 5))
            .await
            .into_result()
            .unwrap();

        let mine = actions.list_reminders(&me).await.into_result().unwrap();
        let messages: Vec<_> = mine.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["sooner", "later"]);
    }

    #[tokio::test]
    async fn test_other_users_reminder_is_not_found() {
        let (_, actions) = setup();
        let id = actions
            .schedule_reminder(&Caller::authenticated("a@x"), draft("mine", 5))
            .await
            .into_result()
            .unwrap();
        let result = actions.delete_reminder(&Caller::authenticated("b@x"), &id).await;
        assert!(matches!(result.error, Some(ActionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_flags() {
        let (_, actions) = setup();
        let me = Caller::authenticated("a@x");
        let work = actions.create_flag(&me, "work", "#ff0000").await.into_result().unwrap();
        let id = actions.schedule_reminder(&me, draft("ship", 5)).await.into_result().unwrap();

        actions
            .set_reminder_flags(&me, &id, vec![work.clone()])
            .await
            .into_result()
            .unwrap();
        let reminders = actions.list_reminders(&me).await.into_result().unwrap();
        assert_eq!(reminders[0].flag_ids, vec![work]);

        let bogus = actions.set_reminder_flags(&me, &id, vec!["nope".into()]).await;
        assert!(matches!(bogus.error, Some(ActionError::NotFound(_))));
        assert_eq!(actions.list_flags(&me).await.into_result().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_delivers_and_marks_sent() {
        let (store, actions) = setup();
        let me = Caller::authenticated("a@x");
        register_device(&store, "a@x", &["phone", "laptop"]).await;

        let mut linked = draft("read this", 1);
        linked.note_id = Some("n1".into());
        linked.note_title = Some("Plans".into());
        actions.schedule_reminder(&me, linked).await.into_result().unwrap();
        actions.schedule_reminder(&me, draft("plain", 2)).await.into_result().unwrap();
        actions.schedule_reminder(&me, draft("not yet", 120)).await.into_result().unwrap();
        // No devices: stays unsent
        actions
            .schedule_reminder(&Caller::authenticated("b@x"), draft("nobody", 1))
            .await
            .into_result()
            .unwrap();

        let delivery = RecordingDelivery {
            failing_endpoint: Some("laptop".into()),
            ..Default::default()
        };
        let now = Utc::now() + Duration::minutes(5);
        let report = actions
            .sweep_due_reminders(now, &delivery)
            .await
            .into_result()
            .unwrap();
        assert_eq!(
            report,
            SweepReport {
                sent: 2,
                skipped: 1,
                failed_deliveries: 1,
                pruned_targets: 1,
            }
        );

        let sent = delivery.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let linked = sent.iter().find(|(_, p)| p.body == "read this").unwrap();
        assert_eq!(linked.1.title, "Reminder: Plans");
        assert_eq!(linked.1.url, "https://notes.example/notes/n1");
        let plain = sent.iter().find(|(_, p)| p.body == "plain").unwrap();
        assert_eq!(plain.1.title, "You have a reminder!");
        assert_eq!(plain.1.url, "https://notes.example/reminders");

        // A second sweep finds only the skipped one
        let report = actions
            .sweep_due_reminders(now, &delivery)
            .await
            .into_result()
            .unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);

        // The expired laptop subscription is gone
        let profile = store.get(&DocKey::User("a@x".into())).await.unwrap().unwrap();
        let endpoints: Vec<_> = profile
            .as_user()
            .unwrap()
            .push_targets
            .iter()
            .map(|t| t.endpoint.as_str())
            .collect();
        assert_eq!(endpoints, vec!["phone"]);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_target() {
        struct Flaky;

        #[async_trait]
        impl PushDelivery for Flaky {
            async fn deliver(&self, target: &PushTarget, _payload: &PushPayload) -> std::result::Result<(), DeliveryError> {
                Err(DeliveryError::Failed(format!("{} timed out", target.endpoint)))
            }
        }

        let (store, actions) = setup();
        let me = Caller::authenticated("a@x");
        register_device(&store, "a@x", &["phone"]).await;
        actions.schedule_reminder(&me, draft("ping", 1)).await.into_result().unwrap();

        let later = Utc::now() + Duration::minutes(2);
        let report = actions.sweep_due_reminders(later, &Flaky).await.into_result().unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed_deliveries, 1);
        assert_eq!(report.pruned_targets, 0);

        let profile = store.get(&DocKey::User("a@x".into())).await.unwrap().unwrap();
        assert_eq!(profile.as_user().unwrap().push_targets.len(), 1);
    }

    #[tokio::test]
    async fn test_edit_clears_sent_flag() {
        let (store, actions) = setup();
        let me = Caller::authenticated("a@x");
        register_device(&store, "a@x", &["phone"]).await;
        let id = actions.schedule_reminder(&me, draft("ping", 1)).await.into_result().unwrap();

        let delivery = RecordingDelivery::default();
        let later = Utc::now() + Duration::minutes(2);
        actions.sweep_due_reminders(later, &delivery).await.into_result().unwrap();
        assert!(actions.list_reminders(&me).await.into_result().unwrap()[0].is_sent);

        actions
            .update_reminder(&me, &id, draft("ping again", 3))
            .await
            .into_result()
            .unwrap();
        let reminder = &actions.list_reminders(&me).await.into_result().unwrap()[0];
        assert!(!reminder.is_sent);
        assert_eq!(reminder.message, "ping again");

        let even_later = Utc::now() + Duration::minutes(4);
        let report = actions
            .sweep_due_reminders(even_later, &delivery)
            .await
            .into_result()
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(delivery.sent.lock().unwrap().len(), 2);
    }
}
