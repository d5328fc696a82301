/*!
# Rescue DevKit - test doubles for the rescue monitor

- Mock MQTT transport, scriptable failures and message injection
- Payload builders for the cancelled / claimed order wire format
- Manual clock, recording alert sink and a full-monitor test harness
*/

pub mod mqtt_stub;
pub mod payloads;
pub mod test_utils;

pub use mqtt_stub::MockTransport;
pub use payloads::EventBuilder;
pub use test_utils::{ManualClock, RecordingAlertSink, TestHarness};
