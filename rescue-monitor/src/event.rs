//! Inbound wire payload and event classification.
//!
//! Payload shape: `{"id": ..., "timestamp": ..., "data": {"event_type": ...}}`,
//! every field optional, unknown fields ignored.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CancelledOrder,
    ClaimedOrder,
    Other,
}

impl EventKind {
    pub fn from_event_type(event_type: Option<&str>) -> Self {
        match event_type {
            Some("order_cancelled") => EventKind::CancelledOrder,
            Some("order_claimed") => EventKind::ClaimedOrder,
            _ => EventKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CancelledOrder => "cancelled_order",
            EventKind::ClaimedOrder => "claimed_order",
            EventKind::Other => "other",
        }
    }
}

/// One decoded message. Lives only while the pipeline processes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundEvent {
    pub id: Option<String>,
    pub event_type: Option<String>,
    /// Raw value, unit unknown until normalized by the staleness filter.
    pub timestamp: Option<i64>,
}

impl InboundEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let id = match object.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let timestamp = match object.get("timestamp") {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        let event_type = object
            .get("data")
            .and_then(|data| data.get("event_type"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            id,
            event_type,
            timestamp,
        })
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_event_type(self.event_type.as_deref())
    }
}

/// Classifies a raw payload. Undecodable payloads are `Other`.
pub fn classify(payload: &[u8]) -> EventKind {
    InboundEvent::decode(payload)
        .map(|event| event.kind())
        .unwrap_or(EventKind::Other)
}
