//! Delivery record as read from the remote log.

use chrono::{DateTime, Local, TimeZone};
use serde_json::{Map, Value};
use std::fmt;

/// Above this, a `createdAt` number is taken to be milliseconds rather than seconds.
pub const MILLIS_THRESHOLD: i64 = 9_999_999_999;

/// The store mixes seconds and milliseconds in `createdAt`; map both to seconds.
pub fn normalize_timestamp(raw: i64) -> i64 {
    if raw > MILLIS_THRESHOLD {
        raw / 1000
    } else {
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Inbound,
    Outbound,
    Unknown,
}

impl MessageSource {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => MessageSource::Inbound,
            "outbound" => MessageSource::Outbound,
            _ => MessageSource::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Inbound => "inbound",
            MessageSource::Outbound => "outbound",
            MessageSource::Unknown => "unknown",
        }
    }
}

/// One logged message. Read-only; the backend owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    /// Document id within the user's sub-collection.
    pub id: String,
    pub server_message_id: String,
    pub body: String,
    pub source: MessageSource,
    /// Unix seconds, already normalized.
    pub created_at: i64,
    pub is_poll: bool,
    pub poll_options: Option<Vec<String>>,
}

impl DeliveryRecord {
    /// Build from decoded document fields (see [`super::decode_fields`]).
    pub fn from_fields(id: impl Into<String>, fields: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            id: id.into(),
            server_message_id: text("serverMessageId"),
            body: text("messageBody"),
            source: MessageSource::parse(&text("source")),
            created_at: fields.get("createdAt").map(created_at_secs).unwrap_or(0),
            is_poll: fields.get("isPoll").and_then(Value::as_bool).unwrap_or(false),
            poll_options: fields.get("questionsAnswers").and_then(poll_options),
        }
    }

    /// Local wall-clock rendering of `created_at`, or "Unknown" when it is zero or out of range.
    pub fn created_at_local(&self) -> String {
        if self.created_at <= 0 {
            return "Unknown".to_string();
        }
        match Local.timestamp_opt(self.created_at, 0).single() {
            Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "Unknown".to_string(),
        }
    }
}

impl fmt::Display for DeliveryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = if self.server_message_id.is_empty() {
            "N/A"
        } else {
            &self.server_message_id
        };
        let body: String = self.body.chars().take(100).collect();
        write!(
            f,
            "[{}] {} ({}) {}",
            self.created_at_local(),
            id,
            self.source.as_str(),
            body
        )?;
        if self.is_poll {
            write!(f, " [poll")?;
            if let Some(opts) = &self.poll_options {
                write!(f, ": {}", opts.join(" | "))?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

fn created_at_secs(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(normalize_timestamp)
            .unwrap_or(0),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp())
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().map(normalize_timestamp))
            .unwrap_or(0),
        _ => 0,
    }
}

fn poll_options(v: &Value) -> Option<Vec<String>> {
    match v {
        Value::Array(items) => Some(
            items
                .iter()
                .map(|i| match i {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::String(s) if !s.is_empty() => Some(vec![s.clone()]),
        _ => None,
    }
}
