//! Data access for the pipeline: messages, contact rollups, notifications and
//! the session/subject lookups the gateway and notification producer need.
//!
//! Every write keyed by a natural identity is a single upsert, so concurrent
//! deliveries for the same key serialize in the store rather than in the
//! application.

use async_trait::async_trait;

use crate::types::{
    ContactRollup, InboundMessage, Notification, NotificationView, RollupUpdate, StoredMessage,
    StreamScope, SubjectDisplay, TenantId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn tenant_exists(&self, tenant_id: TenantId) -> Result<bool, StoreError>;

    /// Insert-or-update keyed by (tenant, provider message id). On conflict only
    /// `status` and `text` are refreshed, and only with non-null values.
    async fn upsert_message(&self, message: &InboundMessage) -> Result<StoredMessage, StoreError>;

    /// Status-only refresh for an already stored message. Never inserts.
    async fn update_message_status(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
        status: &str,
    ) -> Result<Option<StoredMessage>, StoreError>;

    /// Atomic insert-or-update of the (tenant, address) rollup.
    async fn upsert_contact_rollup(
        &self,
        tenant_id: TenantId,
        address: &str,
        update: &RollupUpdate,
    ) -> Result<ContactRollup, StoreError>;

    async fn mark_contact_read(
        &self,
        tenant_id: TenantId,
        address: &str,
    ) -> Result<Option<ContactRollup>, StoreError>;

    async fn insert_notification(
        &self,
        tenant_id: TenantId,
        subject_id: i64,
        kind: &str,
        message: &str,
    ) -> Result<Notification, StoreError>;

    async fn notification_view(
        &self,
        notification_id: i64,
    ) -> Result<Option<NotificationView>, StoreError>;

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError>;

    /// False when no such notification exists for the tenant.
    async fn mark_notification_read(
        &self,
        tenant_id: TenantId,
        notification_id: i64,
    ) -> Result<bool, StoreError>;

    async fn lookup_subject_display(
        &self,
        subject_id: i64,
    ) -> Result<Option<SubjectDisplay>, StoreError>;

    /// Resolve a session token into the event stream scope it may observe.
    async fn resolve_session(&self, token: &str) -> Result<Option<StreamScope>, StoreError>;
}
