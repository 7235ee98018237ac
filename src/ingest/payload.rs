//! Provider callback parsing. Everything here is pure: a raw JSON record goes
//! in, a normalized `ProviderRecord` (or a reason to ignore it) comes out.

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::types::{MediaInfo, MessageKind, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    MessageUpsert,
    MessageUpdate,
    MessageSent,
}

impl ProviderEvent {
    /// Accepts both `messages.upsert` and `MESSAGES_UPSERT` spellings.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', ".");
        match normalized.as_str() {
            "messages.upsert" => Some(ProviderEvent::MessageUpsert),
            "messages.update" => Some(ProviderEvent::MessageUpdate),
            "send.message" => Some(ProviderEvent::MessageSent),
            _ => None,
        }
    }
}

/// Instance names look like `7 - Loja Centro`, `empresa_7 Loja` or
/// `tenant-7-loja`: an optional alphabetic prefix, the numeric tenant id, then
/// a free-text label.
pub fn parse_tenant_id(instance: &str) -> Option<TenantId> {
    let pattern = Regex::new(r"^\s*[A-Za-z]*[_\-#]?(\d+)(?:$|[\s_\-:|.])").ok()?;
    let captures = pattern.captures(instance)?;
    let tenant_id = captures.get(1)?.as_str().parse::<TenantId>().ok()?;
    (tenant_id > 0).then_some(tenant_id)
}

/// The contact address behind a provider jid, or `None` for groups,
/// broadcast lists, status updates and newsletters.
pub fn conversation_address(jid: &str) -> Option<String> {
    let jid = jid.trim();
    if jid.is_empty()
        || jid.ends_with("@g.us")
        || jid.ends_with("@broadcast")
        || jid.ends_with("@newsletter")
    {
        return None;
    }
    let user = jid.split('@').next().unwrap_or(jid);
    let address = user.split(':').next().unwrap_or(user).trim();
    (!address.is_empty()).then(|| address.to_string())
}

/// Provider statuses arrive either as names or as their numeric codes.
pub fn normalize_status(value: &Value) -> Option<String> {
    const CODES: [&str; 6] = [
        "ERROR",
        "PENDING",
        "SERVER_ACK",
        "DELIVERY_ACK",
        "READ",
        "PLAYED",
    ];
    match value {
        Value::Number(number) => {
            let code = usize::try_from(number.as_u64()?).ok()?;
            CODES.get(code).map(|status| status.to_string())
        }
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            match text.parse::<usize>() {
                Ok(code) => CODES.get(code).map(|status| status.to_string()),
                Err(_) => Some(text.to_ascii_uppercase()),
            }
        }
        _ => None,
    }
}

/// Seconds since the epoch from a number, a numeric string or a `{low, high}`
/// long. Falls back to now.
pub fn normalize_timestamp(value: Option<&Value>) -> i64 {
    let parsed = match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|seconds| seconds as i64)),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        Some(Value::Object(long)) => long.get("low").and_then(Value::as_i64),
        _ => None,
    };
    match parsed {
        // milliseconds
        Some(value) if value > 10_000_000_000 => value / 1000,
        Some(value) if value > 0 => value,
        _ => Utc::now().timestamp(),
    }
}

/// `data` may be a single record or an array of them.
pub fn records(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Image {
        caption: Option<String>,
        url: Option<String>,
        mime_type: Option<String>,
    },
    Video {
        caption: Option<String>,
        url: Option<String>,
        mime_type: Option<String>,
    },
    Audio {
        url: Option<String>,
        mime_type: Option<String>,
    },
    Document {
        file_name: Option<String>,
        caption: Option<String>,
        url: Option<String>,
        mime_type: Option<String>,
    },
    Sticker {
        url: Option<String>,
        mime_type: Option<String>,
    },
    Location,
    Contact,
    Reaction,
    Protocol,
    Unsupported,
}

fn text_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

impl MessageContent {
    /// Classify a provider `message` object, looking through ephemeral and
    /// view-once wrappers.
    pub fn from_message(message: &Value) -> Option<Self> {
        let message = unwrap_message(message);
        let object = message.as_object()?;
        if object.is_empty() {
            return None;
        }

        if let Some(text) = text_field(message, "conversation") {
            return Some(MessageContent::Text(text));
        }
        if let Some(extended) = message.get("extendedTextMessage") {
            if let Some(text) = text_field(extended, "text") {
                return Some(MessageContent::Text(text));
            }
        }
        if let Some(image) = message.get("imageMessage") {
            return Some(MessageContent::Image {
                caption: text_field(image, "caption"),
                url: text_field(image, "url"),
                mime_type: text_field(image, "mimetype"),
            });
        }
        if let Some(video) = message.get("videoMessage") {
            return Some(MessageContent::Video {
                caption: text_field(video, "caption"),
                url: text_field(video, "url"),
                mime_type: text_field(video, "mimetype"),
            });
        }
        if let Some(audio) = message.get("audioMessage") {
            return Some(MessageContent::Audio {
                url: text_field(audio, "url"),
                mime_type: text_field(audio, "mimetype"),
            });
        }
        let document = message.get("documentMessage").or_else(|| {
            message
                .get("documentWithCaptionMessage")
                .and_then(|wrapper| wrapper.get("message"))
                .and_then(|inner| inner.get("documentMessage"))
        });
        if let Some(document) = document {
            return Some(MessageContent::Document {
                file_name: text_field(document, "fileName")
                    .or_else(|| text_field(document, "title")),
                caption: text_field(document, "caption"),
                url: text_field(document, "url"),
                mime_type: text_field(document, "mimetype"),
            });
        }
        if let Some(sticker) = message.get("stickerMessage") {
            return Some(MessageContent::Sticker {
                url: text_field(sticker, "url"),
                mime_type: text_field(sticker, "mimetype"),
            });
        }
        if object.contains_key("locationMessage") || object.contains_key("liveLocationMessage") {
            return Some(MessageContent::Location);
        }
        if object.contains_key("contactMessage") || object.contains_key("contactsArrayMessage") {
            return Some(MessageContent::Contact);
        }
        if object.contains_key("reactionMessage") {
            return Some(MessageContent::Reaction);
        }
        if object.contains_key("protocolMessage") {
            return Some(MessageContent::Protocol);
        }
        // senderKeyDistributionMessage and messageContextInfo ride along with
        // real content; on their own they carry nothing to show
        let only_metadata = object.keys().all(|key| {
            key == "messageContextInfo" || key == "senderKeyDistributionMessage"
        });
        if only_metadata {
            return None;
        }
        Some(MessageContent::Unsupported)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text(_) => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
            MessageContent::Video { .. } => MessageKind::Video,
            MessageContent::Audio { .. } => MessageKind::Audio,
            MessageContent::Document { .. } => MessageKind::Document,
            MessageContent::Sticker { .. } => MessageKind::Sticker,
            MessageContent::Location => MessageKind::Location,
            MessageContent::Contact => MessageKind::Contact,
            MessageContent::Reaction => MessageKind::Reaction,
            MessageContent::Protocol | MessageContent::Unsupported => MessageKind::Unsupported,
        }
    }

    /// Reactions and protocol records (revokes, edits, key shares) never become
    /// conversation messages.
    pub fn is_ignored(&self) -> bool {
        matches!(self, MessageContent::Reaction | MessageContent::Protocol)
    }

    /// Display text and media descriptor for this content.
    pub fn render(&self) -> (Option<String>, Option<MediaInfo>) {
        let media = |kind: MessageKind, url: &Option<String>, mime_type: &Option<String>| {
            Some(MediaInfo {
                kind,
                url: url.clone(),
                mime_type: mime_type.clone(),
            })
        };
        match self {
            MessageContent::Text(text) => (Some(text.clone()), None),
            MessageContent::Image {
                caption,
                url,
                mime_type,
            } => (
                Some(caption.clone().unwrap_or_else(|| "📷".to_string())),
                media(MessageKind::Image, url, mime_type),
            ),
            MessageContent::Video {
                caption,
                url,
                mime_type,
            } => (
                Some(caption.clone().unwrap_or_else(|| "🎥".to_string())),
                media(MessageKind::Video, url, mime_type),
            ),
            MessageContent::Audio { url, mime_type } => (
                Some("🎤 Áudio".to_string()),
                media(MessageKind::Audio, url, mime_type),
            ),
            MessageContent::Document {
                file_name,
                caption,
                url,
                mime_type,
            } => (
                Some(
                    file_name
                        .clone()
                        .or_else(|| caption.clone())
                        .unwrap_or_else(|| "📄 Documento".to_string()),
                ),
                media(MessageKind::Document, url, mime_type),
            ),
            MessageContent::Sticker { url, mime_type } => (
                Some("🏷️ Figurinha".to_string()),
                media(MessageKind::Sticker, url, mime_type),
            ),
            MessageContent::Location => (Some("📍 Localização".to_string()), None),
            MessageContent::Contact => (Some("👤 Contato".to_string()), None),
            MessageContent::Reaction => (Some("❤️ Reação".to_string()), None),
            MessageContent::Protocol | MessageContent::Unsupported => (None, None),
        }
    }
}

fn unwrap_message(message: &Value) -> &Value {
    let mut current = message;
    for _ in 0..3 {
        let inner = ["ephemeralMessage", "viewOnceMessage", "viewOnceMessageV2"]
            .iter()
            .find_map(|wrapper| current.get(*wrapper).and_then(|node| node.get("message")));
        match inner {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}

/// Why a record did not produce a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSkip {
    MissingKey,
    IgnoredAddress,
    IgnoredContent,
    NoContent,
}

impl RecordSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSkip::MissingKey => "missing_key",
            RecordSkip::IgnoredAddress => "ignored_address",
            RecordSkip::IgnoredContent => "ignored_content",
            RecordSkip::NoContent => "no_content",
        }
    }
}

/// One provider record after normalization.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub address: String,
    pub provider_message_id: String,
    pub from_me: bool,
    pub push_name: Option<String>,
    pub timestamp: i64,
    pub status: Option<String>,
    pub content: Option<MessageContent>,
}

impl ProviderRecord {
    /// Reads the identity either from a nested `key` object (upserts) or from
    /// flat fields (status updates).
    pub fn parse(record: &Value) -> Result<Self, RecordSkip> {
        let key = record.get("key").unwrap_or(record);
        let jid = text_field(key, "remoteJid")
            .or_else(|| text_field(record, "remoteJid"))
            .ok_or(RecordSkip::MissingKey)?;
        let provider_message_id = text_field(key, "id")
            .or_else(|| text_field(record, "keyId"))
            .or_else(|| text_field(record, "messageId"))
            .ok_or(RecordSkip::MissingKey)?;
        let address = conversation_address(&jid).ok_or(RecordSkip::IgnoredAddress)?;
        let from_me = key
            .get("fromMe")
            .or_else(|| record.get("fromMe"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let status = record
            .get("status")
            .or_else(|| record.get("update").and_then(|update| update.get("status")))
            .and_then(normalize_status);
        let content = record.get("message").and_then(MessageContent::from_message);

        Ok(Self {
            address,
            provider_message_id,
            from_me,
            push_name: text_field(record, "pushName"),
            timestamp: normalize_timestamp(record.get("messageTimestamp")),
            status,
            content,
        })
    }
}
