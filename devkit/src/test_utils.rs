/*!
Test harness for the monitor

Wires a `RescueMonitor` over the mock transport, in-memory stores, a
manual clock and a recording alert sink, so integration tests drive the
whole system without a broker, a disk or real time.
*/

use crate::mqtt_stub::MockTransport;
use crate::payloads::EventBuilder;
use anyhow::Result;
use parking_lot::Mutex;
use rescue_monitor::alert::{Alert, AlertError, AlertSink};
use rescue_monitor::clock::Clock;
use rescue_monitor::health::HeartbeatLog;
use rescue_monitor::models::{ChannelConfig, EpochMillis, Location, MonitorState};
use rescue_monitor::service::{RescueMonitor, ServiceSettings};
use rescue_monitor::storage::{KeyValueStore, MemoryStore};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Starts at the current wall-clock time.
    pub fn from_system() -> Self {
        Self::new(chrono::Utc::now().timestamp_millis())
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, to: EpochMillis) {
        self.now.store(to, Ordering::SeqCst);
    }

    pub fn now_secs(&self) -> i64 {
        self.now_ms() / 1000
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Keeps every alert it is given.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl AlertSink for RecordingAlertSink {
    fn fire(&self, alert: &Alert) -> Result<(), AlertError> {
        log::info!("[HARNESS] alert {:?} for {:?}", alert.reason, alert.message_id);
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

pub fn test_location() -> Location {
    Location {
        id: "loc-downtown".into(),
        name: "Downtown".into(),
    }
}

pub fn test_channel() -> ChannelConfig {
    ChannelConfig {
        broker_host: "broker.test".into(),
        broker_port: 1883,
        tls: false,
        channel: "orders/downtown".into(),
        qos: 1,
        username: Some("watcher".into()),
        password: Some("s3cret".into()),
        keep_alive_secs: 30,
        client_id_prefix: "rescue".into(),
    }
}

pub struct TestHarness {
    pub transport: MockTransport,
    pub clock: Arc<ManualClock>,
    pub alerts: Arc<RecordingAlertSink>,
    pub heartbeat: Arc<HeartbeatLog>,
    pub state_store: Arc<MemoryStore>,
    pub dedup_store: Arc<MemoryStore>,
    pub settings: ServiceSettings,
    pub monitor: Arc<RescueMonitor<MockTransport>>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_settings(ServiceSettings::default())
    }

    pub fn with_settings(settings: ServiceSettings) -> Result<Self> {
        env_logger::try_init().ok();

        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::from_system());
        let alerts = Arc::new(RecordingAlertSink::new());
        let heartbeat = Arc::new(HeartbeatLog::new());
        let state_store = Arc::new(MemoryStore::new());
        let dedup_store = Arc::new(MemoryStore::new());

        let monitor = Self::build_monitor(
            &transport,
            &clock,
            &alerts,
            &heartbeat,
            &state_store,
            &dedup_store,
            settings,
        )?;

        Ok(Self {
            transport,
            clock,
            alerts,
            heartbeat,
            state_store,
            dedup_store,
            settings,
            monitor,
        })
    }

    fn build_monitor(
        transport: &MockTransport,
        clock: &Arc<ManualClock>,
        alerts: &Arc<RecordingAlertSink>,
        heartbeat: &Arc<HeartbeatLog>,
        state_store: &Arc<MemoryStore>,
        dedup_store: &Arc<MemoryStore>,
        settings: ServiceSettings,
    ) -> Result<Arc<RescueMonitor<MockTransport>>> {
        let state_store: Arc<dyn KeyValueStore> = state_store.clone();
        let dedup_store: Arc<dyn KeyValueStore> = dedup_store.clone();
        let monitor = RescueMonitor::builder(transport.clone())
            .state_store(state_store)
            .dedup_store(dedup_store)
            .alerts(alerts.clone())
            .clock(clock.clone())
            .heartbeat_sink(heartbeat.clone())
            .settings(settings)
            .build()?;
        Ok(Arc::new(monitor))
    }

    /// Simulates a process restart: the old monitor is shut down and a new
    /// one is built over the same stores. Nothing is resumed yet.
    pub async fn restart(&mut self) -> Result<()> {
        self.monitor.shutdown().await;
        self.monitor = Self::build_monitor(
            &self.transport,
            &self.clock,
            &self.alerts,
            &self.heartbeat,
            &self.state_store,
            &self.dedup_store,
            self.settings,
        )?;
        log::info!("[HARNESS] monitor restarted");
        Ok(())
    }

    pub async fn activate(&self) -> Result<MonitorState> {
        Ok(self.monitor.activate(test_location(), test_channel()).await?)
    }

    pub async fn wait_connected(&self) -> Result<()> {
        let mut connectivity = self.monitor.connectivity();
        tokio::time::timeout(Duration::from_secs(5), connectivity.wait_for(|c| *c))
            .await
            .map_err(|_| anyhow::anyhow!("monitor never connected"))??;
        Ok(())
    }

    /// Delivers `event` stamped with the harness clock (seconds).
    pub async fn deliver(&self, event: EventBuilder) -> Result<()> {
        let bytes = event.at_secs(self.clock.now_secs()).to_bytes()?;
        self.transport.deliver(bytes).await
    }

    pub async fn deliver_raw(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.transport.deliver(payload).await
    }

    pub fn state(&self) -> Option<MonitorState> {
        self.monitor
            .current_state()
            .ok()
            .and_then(|status| status.into_state())
    }

    /// Polls until `check` holds on the persisted state.
    pub async fn wait_for_state<F>(&self, what: &str, check: F) -> Result<MonitorState>
    where
        F: Fn(&MonitorState) -> bool,
    {
        for _ in 0..200 {
            if let Some(state) = self.state() {
                if check(&state) {
                    return Ok(state);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timed out waiting for {what}; last state: {:?}", self.state())
    }
}
