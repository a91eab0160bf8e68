use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant of an inbound protocol event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Notice,
    Request,
    Meta,
}

impl EventKind {
    /// Maps the backend's `post_type` field.
    pub fn from_post_type(post_type: &str) -> Option<Self> {
        match post_type {
            "message" | "message_sent" => Some(EventKind::Message),
            "notice" => Some(EventKind::Notice),
            "request" => Some(EventKind::Request),
            "meta_event" => Some(EventKind::Meta),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Message => "message",
            EventKind::Notice => "notice",
            EventKind::Request => "request",
            EventKind::Meta => "meta_event",
        }
    }
}

/// Where a message event was posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatScope {
    Group,
    Private,
}

impl ChatScope {
    pub fn from_message_type(message_type: &str) -> Option<Self> {
        match message_type {
            "group" => Some(ChatScope::Group),
            "private" => Some(ChatScope::Private),
            _ => None,
        }
    }
}

/// Immutable inbound event.
///
/// Built once by ingress, shared behind an `Arc` with every plugin
/// invocation and dropped when the last invocation finishes.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Dedup identifier (see `EventParser` for how it is derived)
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub chat_scope: Option<ChatScope>,
    pub sender_id: Option<i64>,
    pub group_id: Option<i64>,
    pub raw_text: Option<String>,
    /// `notice_type`, `request_type` or `meta_event_type`
    pub sub_type: Option<String>,
    /// The backend's own `sub_type` refinement
    pub detail_type: Option<String>,
    /// Original payload, for fields the core does not model
    pub raw: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            chat_scope: None,
            sender_id: None,
            group_id: None,
            raw_text: None,
            sub_type: None,
            detail_type: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Private or group text message
    pub fn message(scope: ChatScope, sender_id: i64, text: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Message);
        event.chat_scope = Some(scope);
        event.sender_id = Some(sender_id);
        event.raw_text = Some(text.into());
        event
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_group(mut self, group_id: i64) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn is_group_message(&self) -> bool {
        self.kind == EventKind::Message && self.chat_scope == Some(ChatScope::Group)
    }

    /// Field lookup on the original payload
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.raw.get(name)
    }
}
