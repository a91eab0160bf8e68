//! Event parser - Turns raw backend payloads into structured events

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::application::errors::BotError;
use crate::domain::entities::{ChatScope, Event, EventKind};
use super::dedup::fingerprint;

/// Parses inbound JSON payloads into `Event`s
#[derive(Debug, Default, Clone)]
pub struct EventParser;

impl EventParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one payload. Only `post_type` is mandatory.
    pub fn parse(&self, raw: Value) -> Result<Event, BotError> {
        let post_type = raw
            .get("post_type")
            .and_then(Value::as_str)
            .ok_or_else(|| BotError::Parse("event has no post_type".to_string()))?;

        let kind = EventKind::from_post_type(post_type)
            .ok_or_else(|| BotError::Parse(format!("unknown post_type: {}", post_type)))?;

        let mut event = Event::new(kind);
        event.id = Self::event_id(kind, &raw);

        if let Some(ts) = raw.get("time").and_then(Value::as_i64) {
            if let Some(parsed) = Utc.timestamp_opt(ts, 0).single() {
                event.timestamp = parsed;
            }
        }

        event.sender_id = Self::int_field(&raw, "user_id");
        event.group_id = Self::int_field(&raw, "group_id");
        event.detail_type = Self::str_field(&raw, "sub_type");

        match kind {
            EventKind::Message => {
                event.chat_scope = raw
                    .get("message_type")
                    .and_then(Value::as_str)
                    .and_then(ChatScope::from_message_type);
                event.raw_text = Self::str_field(&raw, "raw_message");
            }
            EventKind::Notice => {
                event.sub_type = Self::str_field(&raw, "notice_type");
            }
            EventKind::Request => {
                event.sub_type = Self::str_field(&raw, "request_type");
            }
            EventKind::Meta => {
                event.sub_type = Self::str_field(&raw, "meta_event_type");
            }
        }

        event.raw = raw;
        Ok(event)
    }

    /// Backend ids where they exist, otherwise a hash of the whole payload
    fn event_id(kind: EventKind, raw: &Value) -> String {
        if kind == EventKind::Message {
            if let Some(id) = raw.get("message_id").and_then(Self::scalar) {
                return format!("msg:{}", id);
            }
        }
        if kind == EventKind::Request {
            if let Some(flag) = raw.get("flag").and_then(Self::scalar) {
                return format!("req:{}", flag);
            }
        }
        fingerprint(kind.as_str(), raw)
    }

    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Ids arrive as numbers from most backends, as strings from some
    fn int_field(raw: &Value, name: &str) -> Option<i64> {
        match raw.get(name)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn str_field(raw: &Value, name: &str) -> Option<String> {
        raw.get(name).and_then(Value::as_str).map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_group_message() {
        let event = EventParser::new()
            .parse(json!({
                "post_type": "message",
                "message_type": "group",
                "message_id": 12345,
                "user_id": 10001,
                "group_id": "20002",
                "raw_message": "hello",
                "sub_type": "normal",
                "time": 1700000000
            }))
            .unwrap();

        assert_eq!(event.id, "msg:12345");
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.chat_scope, Some(ChatScope::Group));
        assert_eq!(event.sender_id, Some(10001));
        assert_eq!(event.group_id, Some(20002));
        assert_eq!(event.raw_text.as_deref(), Some("hello"));
        assert_eq!(event.detail_type.as_deref(), Some("normal"));
        assert_eq!(event.timestamp.timestamp(), 1700000000);
        assert!(event.is_group_message());
    }

    #[test]
    fn notice_without_id_gets_stable_hash() {
        let payload = json!({
            "post_type": "notice",
            "notice_type": "group_increase",
            "group_id": 1,
            "user_id": 2
        });
        let parser = EventParser::new();
        let a = parser.parse(payload.clone()).unwrap();
        let b = parser.parse(payload).unwrap();

        assert_eq!(a.sub_type.as_deref(), Some("group_increase"));
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn request_uses_flag() {
        let event = EventParser::new()
            .parse(json!({"post_type": "request", "request_type": "friend", "flag": "abc"}))
            .unwrap();
        assert_eq!(event.id, "req:abc");
        assert_eq!(event.sub_type.as_deref(), Some("friend"));
    }

    #[test]
    fn meta_event_maps_to_meta_kind() {
        let event = EventParser::new()
            .parse(json!({"post_type": "meta_event", "meta_event_type": "heartbeat"}))
            .unwrap();
        assert_eq!(event.kind, EventKind::Meta);
        assert_eq!(event.sub_type.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn rejects_missing_or_unknown_post_type() {
        let parser = EventParser::new();
        assert!(matches!(parser.parse(json!({"foo": 1})), Err(BotError::Parse(_))));
        assert!(matches!(parser.parse(json!({"post_type": "weird"})), Err(BotError::Parse(_))));
    }
}
