use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use super::{Store, StoreError};
use crate::types::{
    ContactRollup, InboundMessage, MessageKind, Notification, NotificationView, RollupUpdate,
    StoredMessage, StreamScope, SubjectDisplay, TenantId,
};

const MESSAGE_COLUMNS: &str = "id, tenant_id, address, provider_message_id, from_me, sender_name, kind, text, \
     timestamp, status, has_media, media_kind, media_url, created_at";

const CONTACT_COLUMNS: &str = "tenant_id, address, display_name, last_message, last_message_at, \
     last_from_me, unread_count, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, subject_id, kind, message, read, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn parse_message_row(row: &PgRow, inserted: bool) -> Result<StoredMessage, sqlx::Error> {
    Ok(StoredMessage {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        address: row.try_get("address")?,
        provider_message_id: row.try_get("provider_message_id")?,
        from_me: row.try_get("from_me")?,
        sender_name: row.try_get("sender_name")?,
        kind: MessageKind::parse(&row.try_get::<String, _>("kind")?),
        text: row.try_get("text")?,
        timestamp: row.try_get("timestamp")?,
        status: row.try_get("status")?,
        has_media: row.try_get("has_media")?,
        media_kind: row.try_get("media_kind")?,
        media_url: row.try_get("media_url")?,
        created_at: row.try_get("created_at")?,
        inserted,
    })
}

fn parse_contact_row(row: &PgRow) -> Result<ContactRollup, sqlx::Error> {
    Ok(ContactRollup {
        tenant_id: row.try_get("tenant_id")?,
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        last_message: row.try_get("last_message")?,
        last_message_at: row.try_get("last_message_at")?,
        last_from_me: row.try_get("last_from_me")?,
        unread_count: row.try_get("unread_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_notification_row(row: &PgRow) -> Result<Notification, sqlx::Error> {
    Ok(Notification {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        subject_id: row.try_get("subject_id")?,
        kind: row.try_get("kind")?,
        message: row.try_get("message")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn tenant_exists(&self, tenant_id: TenantId) -> Result<bool, StoreError> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM tenants WHERE id = $1)")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn upsert_message(&self, message: &InboundMessage) -> Result<StoredMessage, StoreError> {
        let media_kind = message.media.as_ref().map(|media| media.kind.as_str());
        let media_url = message.media.as_ref().and_then(|media| media.url.clone());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO whatsapp_messages (
                tenant_id, address, provider_message_id, from_me, sender_name, kind, text,
                timestamp, status, has_media, media_kind, media_url, raw
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            ON CONFLICT (tenant_id, provider_message_id) DO UPDATE SET
                status = COALESCE(EXCLUDED.status, whatsapp_messages.status),
                text = COALESCE(EXCLUDED.text, whatsapp_messages.text)
            RETURNING {MESSAGE_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(message.tenant_id)
        .bind(&message.address)
        .bind(&message.provider_message_id)
        .bind(message.from_me)
        .bind(&message.sender_name)
        .bind(message.kind.as_str())
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(&message.status)
        .bind(message.media.is_some())
        .bind(media_kind)
        .bind(media_url)
        .bind(&message.raw)
        .fetch_one(&self.pool)
        .await?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(parse_message_row(&row, inserted)?)
    }

    async fn update_message_status(
        &self,
        tenant_id: TenantId,
        provider_message_id: &str,
        status: &str,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE whatsapp_messages SET status = $1 \
             WHERE tenant_id = $2 AND provider_message_id = $3 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(status)
        .bind(tenant_id)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| parse_message_row(&row, false))
            .transpose()?)
    }

    async fn upsert_contact_rollup(
        &self,
        tenant_id: TenantId,
        address: &str,
        update: &RollupUpdate,
    ) -> Result<ContactRollup, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO whatsapp_contacts (
                tenant_id, address, display_name, last_message, last_message_at, last_from_me,
                unread_count, updated_at
            ) VALUES (
                $1, $2, NULLIF(BTRIM($3), ''), $4, $5, $6,
                CASE WHEN $6 OR NOT $7 THEN 0 ELSE 1 END, now()
            )
            ON CONFLICT (tenant_id, address) DO UPDATE SET
                display_name = COALESCE(EXCLUDED.display_name, whatsapp_contacts.display_name),
                last_message = EXCLUDED.last_message,
                last_message_at = EXCLUDED.last_message_at,
                last_from_me = EXCLUDED.last_from_me,
                unread_count = CASE
                    WHEN EXCLUDED.last_from_me THEN 0
                    WHEN $7 THEN whatsapp_contacts.unread_count + 1
                    ELSE whatsapp_contacts.unread_count
                END,
                updated_at = now()
            RETURNING {CONTACT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(address)
        .bind(&update.display_name)
        .bind(&update.last_message)
        .bind(update.last_message_at)
        .bind(update.last_from_me)
        .bind(update.count_unread)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_contact_row(&row)?)
    }

    async fn mark_contact_read(
        &self,
        tenant_id: TenantId,
        address: &str,
    ) -> Result<Option<ContactRollup>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE whatsapp_contacts SET unread_count = 0, updated_at = now() \
             WHERE tenant_id = $1 AND address = $2 \
             RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| parse_contact_row(&row)).transpose()?)
    }

    async fn insert_notification(
        &self,
        tenant_id: TenantId,
        subject_id: i64,
        kind: &str,
        message: &str,
    ) -> Result<Notification, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO notifications (tenant_id, subject_id, kind, message) \
             VALUES ($1,$2,$3,$4) RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(subject_id)
        .bind(kind)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_notification_row(&row)?)
    }

    async fn notification_view(
        &self,
        notification_id: i64,
    ) -> Result<Option<NotificationView>, StoreError> {
        let row = sqlx::query(
            "SELECT n.id, n.tenant_id, n.subject_id, n.kind, n.message, n.read, n.created_at, \
                    t.name AS tenant_name, c.name AS subject_name, c.phone AS subject_phone \
             FROM notifications n \
             LEFT JOIN tenants t ON t.id = n.tenant_id \
             LEFT JOIN customers c ON c.id = n.subject_id \
             WHERE n.id = $1",
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(NotificationView {
            notification: parse_notification_row(&row)?,
            tenant_name: row.try_get("tenant_name")?,
            subject_name: row.try_get("subject_name")?,
            subject_phone: row.try_get("subject_phone")?,
        }))
    }

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        unread_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE tenant_id = $1 AND (NOT $2 OR read = FALSE) \
             ORDER BY created_at DESC, id DESC \
             LIMIT 200"
        ))
        .bind(tenant_id)
        .bind(unread_only)
        .fetch_all(&self.pool)
        .await?;
        let notifications = rows
            .iter()
            .map(parse_notification_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notifications)
    }

    async fn mark_notification_read(
        &self,
        tenant_id: TenantId,
        notification_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read = TRUE WHERE id = $1 AND tenant_id = $2",
        )
        .bind(notification_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lookup_subject_display(
        &self,
        subject_id: i64,
    ) -> Result<Option<SubjectDisplay>, StoreError> {
        let row = sqlx::query("SELECT name, phone FROM customers WHERE id = $1")
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SubjectDisplay {
            name: row.try_get("name")?,
            phone: row.try_get("phone")?,
        }))
    }

    async fn resolve_session(&self, token: &str) -> Result<Option<StreamScope>, StoreError> {
        let row = sqlx::query("SELECT tenant_id, is_admin FROM auth_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tenant_id: Option<TenantId> = row.try_get("tenant_id")?;
        let is_admin: bool = row.try_get("is_admin")?;
        Ok(match (tenant_id, is_admin) {
            (_, true) => Some(StreamScope::All),
            (Some(tenant_id), false) => Some(StreamScope::Tenant(tenant_id)),
            (None, false) => None,
        })
    }
}
