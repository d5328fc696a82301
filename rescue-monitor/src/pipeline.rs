/**
 * MESSAGE PIPELINE - one inbound payload, start to finish
 *
 * HOW IT WORKS :
 *   decode -> staleness -> dedup -> classify/count -> cooldown -> alert
 *
 * - Undecodable payloads are dropped after a warning
 * - Dedup runs before classification, so every id is remembered
 * - Cancelled and claimed events are counted even while cooldown holds
 * - Only cancelled orders reach the cooldown gate
 * - Nothing here returns an error to the caller; failures become `Outcome::Failed`
 */

use crate::alert::{Alert, AlertReason, AlertSink};
use crate::clock::Clock;
use crate::cooldown::DEFAULT_COOLDOWN;
use crate::dedup::DedupSet;
use crate::event::{EventKind, InboundEvent};
use crate::staleness::{self, DEFAULT_STALE_THRESHOLD};
use crate::state::{AlertClaim, MonitorStateStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub stale_threshold: Duration,
    pub cooldown: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// What the pipeline did with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Malformed,
    Stale { age_ms: i64 },
    Duplicate,
    /// Neither cancelled nor claimed; nothing counted.
    Ignored,
    /// Claimed order counted.
    Counted { kind: EventKind, count: u64 },
    Alerted { count: u64 },
    Suppressed { count: u64, remaining_ms: i64 },
    /// Monitoring was switched off while the message was in flight.
    Inactive,
    Failed { reason: String },
}

pub struct MessagePipeline {
    state: Arc<MonitorStateStore>,
    dedup: Arc<DedupSet>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl MessagePipeline {
    pub fn new(
        state: Arc<MonitorStateStore>,
        dedup: Arc<DedupSet>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            state,
            dedup,
            alerts,
            clock,
            settings,
        }
    }

    pub fn process(&self, payload: &[u8]) -> Outcome {
        let event = match InboundEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "dropping undecodable message");
                return Outcome::Malformed;
            }
        };

        let now = self.clock.now_ms();

        if staleness::is_stale(event.timestamp, now, self.settings.stale_threshold) {
            let age_ms = event.timestamp.map(|t| staleness::age_ms(t, now)).unwrap_or(0);
            info!(id = ?event.id, age_ms, "dropping stale message");
            return Outcome::Stale { age_ms };
        }

        if let Some(id) = event.id.as_deref() {
            if self.dedup.seen(id) {
                debug!(id, "dropping duplicate message");
                return Outcome::Duplicate;
            }
            if let Err(e) = self.dedup.mark_seen(id, now) {
                // still processed; a redelivery may be counted twice
                error!(id, error = %e, "failed to record message id");
            }
        }

        match event.kind() {
            EventKind::Other => {
                debug!(id = ?event.id, event_type = ?event.event_type, "ignoring event");
                Outcome::Ignored
            }
            EventKind::ClaimedOrder => match self.state.increment_claimed() {
                Ok(Some(count)) => Outcome::Counted {
                    kind: EventKind::ClaimedOrder,
                    count,
                },
                Ok(None) => Outcome::Inactive,
                Err(e) => failed("claimed counter", e),
            },
            EventKind::CancelledOrder => self.cancelled(event, now),
        }
    }

    fn cancelled(&self, event: InboundEvent, now: i64) -> Outcome {
        let count = match self.state.increment_cancelled() {
            Ok(Some(count)) => count,
            Ok(None) => return Outcome::Inactive,
            Err(e) => return failed("cancelled counter", e),
        };

        match self.state.try_claim_alert(now, self.settings.cooldown) {
            Ok(AlertClaim::Fire { location, .. }) => {
                let alert = Alert {
                    reason: AlertReason::CancelledOrder,
                    message_id: event.id,
                    location: Some(location),
                    fired_at: now,
                };
                if let Err(e) = self.alerts.fire(&alert) {
                    error!(error = %e, "alert sink failed");
                }
                info!(count, id = ?alert.message_id, "cancelled order alert fired");
                Outcome::Alerted { count }
            }
            Ok(AlertClaim::Suppressed { remaining_ms }) => {
                info!(count, remaining_ms, "cancelled order counted, alert in cooldown");
                Outcome::Suppressed {
                    count,
                    remaining_ms,
                }
            }
            Ok(AlertClaim::Inactive) => Outcome::Inactive,
            Err(e) => failed("cooldown gate", e),
        }
    }
}

fn failed(step: &str, e: impl std::fmt::Display) -> Outcome {
    error!(step, error = %e, "message processing failed");
    Outcome::Failed {
        reason: format!("{step}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertError;
    use crate::models::{ChannelConfig, EpochMillis, Location};
    use crate::storage::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    const START: EpochMillis = 1_700_000_000_000;

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> EpochMillis {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Alert>>);

    impl AlertSink for Recorder {
        fn fire(&self, alert: &Alert) -> Result<(), AlertError> {
            self.0.lock().push(alert.clone());
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<TestClock>,
        state: Arc<MonitorStateStore>,
        alerts: Arc<Recorder>,
        pipeline: MessagePipeline,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(TestClock(AtomicI64::new(START)));
        let state = Arc::new(MonitorStateStore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
        ));
        let dedup = Arc::new(DedupSet::open(Arc::new(MemoryStore::new())).unwrap());
        let alerts = Arc::new(Recorder::default());
        let pipeline = MessagePipeline::new(
            state.clone(),
            dedup,
            alerts.clone(),
            clock.clone(),
            PipelineSettings::default(),
        );
        state
            .activate(
                Location {
                    id: "loc-1".into(),
                    name: "Downtown".into(),
                },
                ChannelConfig {
                    broker_host: "broker.local".into(),
                    broker_port: 1883,
                    tls: false,
                    channel: "orders/downtown".into(),
                    qos: 1,
                    username: None,
                    password: None,
                    keep_alive_secs: 30,
                    client_id_prefix: "rescue".into(),
                },
            )
            .unwrap();
        Fixture {
            clock,
            state,
            alerts,
            pipeline,
        }
    }

    fn payload(id: &str, ts_secs: i64, event_type: &str) -> Vec<u8> {
        format!(r#"{{"id":"{id}","timestamp":{ts_secs},"data":{{"event_type":"{event_type}"}}}}"#)
            .into_bytes()
    }

    #[test]
    fn test_cancelled_alert_cooldown_and_duplicate() {
        let f = fixture();
        let ts = (START - 10_000) / 1000;

        assert_eq!(
            f.pipeline.process(&payload("m1", ts, "order_cancelled")),
            Outcome::Alerted { count: 1 }
        );
        assert_eq!(f.state.current().unwrap().unwrap().last_alert_at, START);

        assert!(matches!(
            f.pipeline.process(&payload("m2", ts, "order_cancelled")),
            Outcome::Suppressed { count: 2, .. }
        ));
        assert_eq!(
            f.pipeline.process(&payload("m1", ts, "order_cancelled")),
            Outcome::Duplicate
        );

        let state = f.state.current().unwrap().unwrap();
        assert_eq!(state.cancelled_count, 2);
        let alerts = f.alerts.0.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].message_id.as_deref(), Some("m1"));
        assert_eq!(alerts[0].location.as_ref().unwrap().name, "Downtown");
    }

    #[test]
    fn test_alert_fires_again_after_cooldown() {
        let f = fixture();
        f.pipeline
            .process(&payload("a", START / 1000, "order_cancelled"));

        f.clock.0.fetch_add(180_000, Ordering::SeqCst);
        let now = f.clock.now_ms();
        assert_eq!(
            f.pipeline.process(&payload("b", now / 1000, "order_cancelled")),
            Outcome::Alerted { count: 2 }
        );
        assert_eq!(f.alerts.0.lock().len(), 2);
    }

    #[test]
    fn test_claimed_counts_without_alert() {
        let f = fixture();
        assert_eq!(
            f.pipeline.process(&payload("c1", START / 1000, "order_claimed")),
            Outcome::Counted {
                kind: EventKind::ClaimedOrder,
                count: 1
            }
        );
        assert!(f.alerts.0.lock().is_empty());
    }

    #[test]
    fn test_other_events_are_remembered_but_not_counted() {
        let f = fixture();
        let p = payload("o1", START / 1000, "order_created");
        assert_eq!(f.pipeline.process(&p), Outcome::Ignored);
        assert_eq!(f.pipeline.process(&p), Outcome::Duplicate);

        let state = f.state.current().unwrap().unwrap();
        assert_eq!((state.cancelled_count, state.claimed_count), (0, 0));
    }

    #[test]
    fn test_stale_and_malformed_dropped_before_dedup() {
        let f = fixture();
        let old = payload("s1", (START - 300_000) / 1000, "order_cancelled");
        assert_eq!(f.pipeline.process(&old), Outcome::Stale { age_ms: 300_000 });
        assert_eq!(f.pipeline.process(b"{oops"), Outcome::Malformed);

        // a stale copy does not poison the id for a later fresh delivery
        let fresh = payload("s1", START / 1000, "order_cancelled");
        assert_eq!(f.pipeline.process(&fresh), Outcome::Alerted { count: 1 });
    }

    #[test]
    fn test_messages_without_id_are_always_new() {
        let f = fixture();
        let p = br#"{"data":{"event_type":"order_claimed"}}"#;
        f.pipeline.process(p);
        f.pipeline.process(p);
        assert_eq!(f.state.current().unwrap().unwrap().claimed_count, 2);
    }

    #[test]
    fn test_inactive_state_is_not_resurrected() {
        let f = fixture();
        f.state.deactivate().unwrap();
        assert_eq!(
            f.pipeline.process(&payload("x", START / 1000, "order_cancelled")),
            Outcome::Inactive
        );
        assert!(!f.state.is_active());
        assert!(f.alerts.0.lock().is_empty());
    }
}
