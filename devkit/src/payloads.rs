/*!
Wire payload builders

Produce the JSON the monitor consumes:
`{"id": ..., "timestamp": ..., "data": {"event_type": ...}}`
*/

use anyhow::Result;
use serde_json::{json, Map, Value};

pub const ORDER_CANCELLED: &str = "order_cancelled";
pub const ORDER_CLAIMED: &str = "order_claimed";

#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    id: Option<String>,
    timestamp: Option<Value>,
    event_type: Option<String>,
    extra: Map<String, Value>,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelled(id: &str) -> Self {
        Self::new().id(id).event_type(ORDER_CANCELLED)
    }

    pub fn claimed(id: &str) -> Self {
        Self::new().id(id).event_type(ORDER_CLAIMED)
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    /// Timestamp in seconds, the unit most publishers use.
    pub fn at_secs(mut self, secs: i64) -> Self {
        self.timestamp = Some(json!(secs));
        self
    }

    pub fn at_millis(mut self, millis: i64) -> Self {
        self.timestamp = Some(json!(millis));
        self
    }

    /// Seconds timestamp taken from the wall clock.
    pub fn now(self) -> Self {
        self.at_secs(chrono::Utc::now().timestamp())
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn build(&self) -> Value {
        let mut object = self.extra.clone();
        if let Some(id) = &self.id {
            object.insert("id".into(), json!(id));
        }
        if let Some(ts) = &self.timestamp {
            object.insert("timestamp".into(), ts.clone());
        }
        if let Some(event_type) = &self.event_type {
            object.insert("data".into(), json!({ "event_type": event_type }));
        }
        Value::Object(object)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.build())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescue_monitor::event::{EventKind, InboundEvent};

    #[test]
    fn test_built_payload_decodes() {
        let bytes = EventBuilder::cancelled("m1").at_secs(1_700_000_000).to_bytes().unwrap();
        let event = InboundEvent::decode(&bytes).unwrap();
        assert_eq!(event.id.as_deref(), Some("m1"));
        assert_eq!(event.timestamp, Some(1_700_000_000));
        assert_eq!(event.kind(), EventKind::CancelledOrder);
    }

    #[test]
    fn test_optional_parts_are_omitted() {
        let value = EventBuilder::new().field("courier", json!("x")).build();
        assert_eq!(value, json!({ "courier": "x" }));
    }
}
