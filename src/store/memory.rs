//! In-process store with the same upsert semantics as the PostgreSQL one.
//! All state sits behind a single mutex, which gives each upsert the same
//! atomicity the unique-constraint upserts have in SQL.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Store, StoreError};
use crate::types::{
    ContactRollup, InboundMessage, Notification, NotificationView, RollupUpdate, StoredMessage,
    StreamScope, SubjectDisplay, TenantId,
};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<TenantId, String>,
    subjects: HashMap<i64, SubjectDisplay>,
    sessions: HashMap<String, StreamScope>,
    messages: Vec<StoredMessage>,
    message_index: HashMap<(TenantId, String), usize>,
    contacts: HashMap<(TenantId, String), ContactRollup>,
    notifications: Vec<Notification>,
    rejected_messages: HashSet<String>,
    rollups_unavailable: bool,
    subjects_unavailable: bool,
    notification_views_unavailable: bool,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(&self, tenant_id: TenantId, name: &str) {
        self.state.lock().tenants.insert(tenant_id, name.to_string());
    }

    pub fn add_subject(&self, subject_id: i64, name: &str, phone: Option<&str>) {
        self.state.lock().subjects.insert(
            subject_id,
            SubjectDisplay {
                name: name.to_string(),
                phone: phone.map(str::to_string),
            },
        );
    }

    pub fn add_session(&self, token: &str, scope: StreamScope) {
        self.state.lock().sessions.insert(token.to_string(), scope);
    }

    /// Make every write of this provider message id fail.
    pub fn reject_message(&self, provider_message_id: &str) {
        self.state
            .lock()
            .rejected_messages
            .insert(provider_message_id.to_string());
    }

    pub fn set_rollups_unavailable(&self, unavailable: bool) {
        self.state.lock().rollups_unavailable = unavailable;
    }

    pub fn set_subjects_unavailable(&self, unavailable: bool) {
        self.state.lock().subjects_unavailable = unavailable;
    }

    pub fn set_notification_views_unavailable(&self, unavailable: bool) {
        self.state.lock().notification_views_unavailable = unavailable;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().messages.clone()
    }

    pub fn contact(&self, tenant_id: TenantId, address: &str) -> Option<ContactRollup> {
        self.state
            .lock()
            .contacts
            .get(&(tenant_id, address.to_string()))
            .cloned()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn tenant_exists(&self, tenant_id: TenantId) -> Result<bool, StoreError> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.tenants.contains_key(&tenant_id))
    }

    async fn upsert_message(&self, message: &InboundMessage) -> Result<StoredMessage, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.rejected_messages.contains(&message.provider_message_id) {
            return Err(StoreError::Unavailable(format!(
                "write rejected for {}",
                message.provider_message_id
            )));
        }

        let key = (message.tenant_id, message.provider_message_id.clone());
        if let Some(&index) = state.message_index.get(&key) {
            let existing = &mut state.messages[index];
            if message.status.is_some() {
                existing.status = message.status.clone();
            }
            if message.text.is_some() {
                existing.text = message.text.clone();
            }
            let mut stored = existing.clone();
            stored.inserted = false;
            return Ok(stored);
        }

        let stored = StoredMessage {
            id: state.messages.len() as i64 + 1,
            tenant_id: message.tenant_id,
            address: message.address.clone(),
            provider_message_id: message.provider_message_id.clone(),
            from_me: message.from_me,
            sender_name: message.sender_name.clone(),
            kind: message.kind,
            text: message.text.clone(),
            timestamp: message.timestamp,
            status: message.status.clone(),
            has_media: message.media.is_some(),
            media_kind: message
                .media
                .as_ref()
                .map(|media| media.kind.as_str().to_string()),
            media_url: message.media.as_ref().and_then(|media| media.url.clone()),
            created_at: Utc::now(),
            inserted: true,
        };
        let index = state.messages.len();
        state.messages.push(stored.clone());
        state.message_index.insert(key, index);
        Ok(stored)
    }

    async fn update_message_status(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
        status: &str,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        let key = (tenant_id, provider_message_id.to_string());
        let Some(&index) = state.message_index.get(&key) else {
            return Ok(None);
        };
        let existing = &mut state.messages[index];
        existing.status = Some(status.to_string());
        let mut stored = existing.clone();
        stored.inserted = false;
        Ok(Some(stored))
    }

    async fn upsert_contact_rollup(
        &self,
        tenant_id: TenantId,
        address: &str,
        update: &RollupUpdate,
    ) -> Result<ContactRollup, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.rollups_unavailable {
            return Err(StoreError::Unavailable("contact rollups offline".to_string()));
        }

        let display_name = update
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let now = Utc::now();
        let contact = state
            .contacts
            .entry((tenant_id, address.to_string()))
            .and_modify(|contact| {
                if display_name.is_some() {
                    contact.display_name = display_name.clone();
                }
                contact.last_message = update.last_message.clone();
                contact.last_message_at = update.last_message_at;
                contact.last_from_me = update.last_from_me;
                if update.last_from_me {
                    contact.unread_count = 0;
                } else if update.count_unread {
                    contact.unread_count += 1;
                }
                contact.updated_at = now;
            })
            .or_insert_with(|| ContactRollup {
                tenant_id,
                address: address.to_string(),
                display_name: display_name.clone(),
                last_message: update.last_message.clone(),
                last_message_at: update.last_message_at,
                last_from_me: update.last_from_me,
                unread_count: if update.last_from_me || !update.count_unread {
                    0
                } else {
                    1
                },
                updated_at: now,
            });
        Ok(contact.clone())
    }

    async fn mark_contact_read(
        &self,
        tenant_id: TenantId,
        address: &str,
    ) -> Result<Option<ContactRollup>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        let Some(contact) = state.contacts.get_mut(&(tenant_id, address.to_string())) else {
            return Ok(None);
        };
        contact.unread_count = 0;
        contact.updated_at = Utc::now();
        Ok(Some(contact.clone()))
    }

    async fn insert_notification(
        &self,
        tenant_id: TenantId,
        subject_id: i64,
        kind: &str,
        message: &str,
    ) -> Result<Notification, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        let notification = Notification {
            id: state.notifications.len() as i64 + 1,
            tenant_id,
            subject_id,
            kind: kind.to_string(),
            message: message.to_string(),
            read: false,
            created_at: Utc::now(),
        };
        state.notifications.push(notification.clone());
        Ok(notification)
    }

    async fn notification_view(
        &self,
        notification_id: i64,
    ) -> Result<Option<NotificationView>, StoreError> {
        let state = self.state.lock();
        state.check_available()?;
        if state.notification_views_unavailable {
            return Err(StoreError::Unavailable("notification view offline".to_string()));
        }
        let Some(notification) = state
            .notifications
            .iter()
            .find(|notification| notification.id == notification_id)
            .cloned()
        else {
            return Ok(None);
        };
        let subject = state.subjects.get(&notification.subject_id).cloned();
        Ok(Some(NotificationView {
            tenant_name: state.tenants.get(&notification.tenant_id).cloned(),
            subject_name: subject.as_ref().map(|subject| subject.name.clone()),
            subject_phone: subject.and_then(|subject| subject.phone),
            notification,
        }))
    }

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .notifications
            .iter()
            .rev()
            .filter(|notification| notification.tenant_id == tenant_id)
            .filter(|notification| !unread_only || !notification.read)
            .cloned()
            .collect())
    }

    async fn mark_notification_read(
        &self,
        tenant_id: TenantId,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        let Some(notification) = state.notifications.iter_mut().find(|notification| {
            notification.id == notification_id && notification.tenant_id == tenant_id
        }) else {
            return Ok(false);
        };
        notification.read = true;
        Ok(true)
    }

    async fn lookup_subject_display(
        &self,
        subject_id: i64,
    ) -> Result<Option<SubjectDisplay>, StoreError> {
        let state = self.state.lock();
        state.check_available()?;
        if state.subjects_unavailable {
            return Err(StoreError::Unavailable("customers table offline".to_string()));
        }
        Ok(state.subjects.get(&subject_id).cloned())
    }

    async fn resolve_session(&self, token: &str) -> Result<Option<StreamScope>, StoreError> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.sessions.get(token).copied())
    }
}
