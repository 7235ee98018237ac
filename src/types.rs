use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TenantId = i64;

/// Which channel of the event bus a stream listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamScope {
    Tenant(TenantId),
    /// Cross-tenant administrative observers.
    All,
}

impl StreamScope {
    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            StreamScope::Tenant(id) => Some(*id),
            StreamScope::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Reaction,
    Unsupported,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Location => "location",
            MessageKind::Contact => "contact",
            MessageKind::Reaction => "reaction",
            MessageKind::Unsupported => "unsupported",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "audio" => MessageKind::Audio,
            "document" => MessageKind::Document,
            "sticker" => MessageKind::Sticker,
            "location" => MessageKind::Location,
            "contact" => MessageKind::Contact,
            "reaction" => MessageKind::Reaction,
            _ => MessageKind::Unsupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub kind: MessageKind,
    pub url: Option<String>,
    pub mime_type: Option<String>,
}

/// Canonical record built from one provider callback item.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub tenant_id: TenantId,
    pub address: String,
    pub provider_message_id: String,
    pub from_me: bool,
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    pub text: Option<String>,
    /// Seconds since the unix epoch, as reported by the provider.
    pub timestamp: i64,
    pub status: Option<String>,
    pub media: Option<MediaInfo>,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub tenant_id: TenantId,
    pub address: String,
    pub provider_message_id: String,
    pub from_me: bool,
    pub sender_name: Option<String>,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub timestamp: i64,
    pub status: Option<String>,
    pub has_media: bool,
    pub media_kind: Option<String>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// False when the write hit an existing row (provider redelivery).
    #[serde(skip)]
    pub inserted: bool,
}

/// Fields the aggregator writes into a contact rollup for one message.
#[derive(Debug, Clone)]
pub struct RollupUpdate {
    pub display_name: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: i64,
    pub last_from_me: bool,
    /// Whether a received message counts towards unread. Redeliveries do not.
    pub count_unread: bool,
}

impl RollupUpdate {
    pub fn from_message(message: &StoredMessage) -> Self {
        // pushName on a self-sent message is the account owner, not the contact
        let display_name = if message.from_me {
            None
        } else {
            message
                .sender_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        };
        Self {
            display_name,
            last_message: message.text.clone(),
            last_message_at: message.timestamp,
            last_from_me: message.from_me,
            count_unread: message.inserted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRollup {
    pub tenant_id: TenantId,
    pub address: String,
    pub display_name: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: i64,
    pub last_from_me: bool,
    pub unread_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub tenant_id: TenantId,
    pub subject_id: i64,
    pub kind: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// A notification joined with the tenant and subject display data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub tenant_name: Option<String>,
    pub subject_name: Option<String>,
    pub subject_phone: Option<String>,
}

impl NotificationView {
    pub fn bare(notification: Notification) -> Self {
        Self {
            notification,
            tenant_name: None,
            subject_name: None,
            subject_phone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectDisplay {
    pub name: String,
    pub phone: Option<String>,
}
