/**
 * RESCUE MONITOR - the service facade
 *
 * ROLE :
 * What the outside world (control API, binary, tests) talks to. Owns the
 * long-lived parts and starts / stops one monitoring run at a time.
 *
 * HOW IT WORKS :
 * - A run = one supervisor + its event dispatcher task + the loop task
 * - `activate` persists the new state then restarts the run
 * - `deactivate` clears the state and stops the run right away
 * - `start` resumes a run after a process restart if state is present
 * - `shutdown` stops the run but keeps the state (process exit)
 * - Connectivity is one watch channel shared by every run, so receivers
 *   handed out earlier keep working across restarts
 */

use crate::alert::{Alert, AlertError, AlertReason, AlertSink, LogAlertSink};
use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::dedup::DedupSet;
use crate::health::{
    HealthTracker, HeartbeatLog, HeartbeatSink, LivenessReport, NoPowerProbe, PowerProbe,
};
use crate::models::{ChannelConfig, Location, MonitorState, MonitorStatus};
use crate::pipeline::{MessagePipeline, PipelineSettings};
use crate::reliability::{LoopExit, LoopSettings, ReliabilityLoop};
use crate::state::{MonitorStateStore, StateError};
use crate::storage::{KeyValueStore, MemoryStore, StoreError};
use crate::supervisor::{ConnectionSupervisor, SupervisorSettings};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("dedup store failure: {0}")]
    Dedup(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceSettings {
    pub pipeline: PipelineSettings,
    pub supervisor: SupervisorSettings,
    pub reliability: LoopSettings,
}

impl ServiceSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            pipeline: config.pipeline_settings(),
            supervisor: config.supervisor_settings(),
            reliability: config.loop_settings(),
        }
    }
}

struct RunningService<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    loop_task: JoinHandle<LoopExit>,
    dispatch_task: JoinHandle<()>,
}

pub struct RescueMonitorBuilder<T> {
    transport: T,
    state_store: Option<Arc<dyn KeyValueStore>>,
    dedup_store: Option<Arc<dyn KeyValueStore>>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    power: Arc<dyn PowerProbe>,
    heartbeat: Arc<dyn HeartbeatSink>,
    settings: ServiceSettings,
}

impl<T: Transport + Clone> RescueMonitorBuilder<T> {
    pub fn state_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn dedup_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.dedup_store = Some(store);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn power_probe(mut self, power: Arc<dyn PowerProbe>) -> Self {
        self.power = power;
        self
    }

    pub fn heartbeat_sink(mut self, heartbeat: Arc<dyn HeartbeatSink>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Stores default to memory (nothing survives the process).
    pub fn build(self) -> Result<RescueMonitor<T>, ServiceError> {
        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let dedup_store = self
            .dedup_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let state = Arc::new(MonitorStateStore::new(state_store, self.clock.clone()));
        let dedup = Arc::new(DedupSet::open(dedup_store)?);
        let (connectivity, _) = watch::channel(false);

        Ok(RescueMonitor {
            transport: self.transport,
            state,
            dedup,
            alerts: self.alerts,
            clock: self.clock,
            power: self.power,
            heartbeat: self.heartbeat,
            health: HealthTracker::new(),
            connectivity: Arc::new(connectivity),
            settings: self.settings,
            running: tokio::sync::Mutex::new(None),
        })
    }
}

pub struct RescueMonitor<T: Transport + Clone> {
    transport: T,
    state: Arc<MonitorStateStore>,
    dedup: Arc<DedupSet>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    power: Arc<dyn PowerProbe>,
    heartbeat: Arc<dyn HeartbeatSink>,
    health: HealthTracker,
    connectivity: Arc<watch::Sender<bool>>,
    settings: ServiceSettings,
    running: tokio::sync::Mutex<Option<RunningService<T>>>,
}

impl<T: Transport + Clone> RescueMonitor<T> {
    pub fn builder(transport: T) -> RescueMonitorBuilder<T> {
        RescueMonitorBuilder {
            transport,
            state_store: None,
            dedup_store: None,
            alerts: Arc::new(LogAlertSink),
            clock: Arc::new(SystemClock),
            power: Arc::new(NoPowerProbe),
            heartbeat: Arc::new(HeartbeatLog::new()),
            settings: ServiceSettings::default(),
        }
    }

    /// Persists a fresh monitoring state and (re)starts the run.
    pub async fn activate(
        &self,
        location: Location,
        channel_config: ChannelConfig,
    ) -> Result<MonitorState, ServiceError> {
        let mut running = self.running.lock().await;
        let state = self.state.activate(location, channel_config)?;
        if let Some(previous) = running.take() {
            info!("restarting monitoring run for new activation");
            stop_run(previous).await;
        }
        *running = Some(self.spawn_run());
        Ok(state)
    }

    /// Clears the state and stops the run immediately.
    pub async fn deactivate(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;
        self.state.deactivate()?;
        if let Some(run) = running.take() {
            stop_run(run).await;
        }
        Ok(())
    }

    /// Resumes monitoring if a persisted state exists. Returns whether a
    /// run is active afterwards.
    pub async fn start(&self) -> Result<bool, ServiceError> {
        let mut running = self.running.lock().await;
        if !self.state.read()?.is_active() {
            debug!("no persisted state, nothing to resume");
            return Ok(false);
        }
        match running.as_ref() {
            Some(run) if !run.loop_task.is_finished() => return Ok(true),
            _ => {}
        }
        if let Some(stale) = running.take() {
            stop_run(stale).await;
        }
        info!("resuming monitoring from persisted state");
        *running = Some(self.spawn_run());
        Ok(true)
    }

    /// Stops the run, keeping the persisted state for the next start.
    pub async fn shutdown(&self) {
        if let Some(run) = self.running.lock().await.take() {
            stop_run(run).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.loop_task.is_finished())
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn current_state(&self) -> Result<MonitorStatus, ServiceError> {
        Ok(self.state.read()?)
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Fires an alert straight to the sink, outside the pipeline and cooldown.
    pub fn trigger_test_alert(&self) -> Result<Alert, AlertError> {
        let location = match self.state.current() {
            Ok(state) => state.map(|s| s.location),
            Err(e) => {
                warn!(error = %e, "state unreadable, test alert without location");
                None
            }
        };
        let alert = Alert {
            reason: AlertReason::Test,
            message_id: None,
            location,
            fired_at: self.clock.now_ms(),
        };
        self.alerts.fire(&alert)?;
        info!("test alert fired");
        Ok(alert)
    }

    pub fn liveness(&self) -> LivenessReport {
        let summary = match self.state.current() {
            Ok(state) => state.map(|s| s.summary()),
            Err(e) => {
                warn!(error = %e, "state unreadable for liveness");
                None
            }
        };
        LivenessReport::new(
            self.is_connected(),
            self.power.power_state(),
            summary,
            self.health.snapshot(),
        )
    }

    pub fn dedup(&self) -> &DedupSet {
        &self.dedup
    }

    fn spawn_run(&self) -> RunningService<T> {
        let pipeline = Arc::new(MessagePipeline::new(
            self.state.clone(),
            self.dedup.clone(),
            self.alerts.clone(),
            self.clock.clone(),
            self.settings.pipeline,
        ));
        let (supervisor, events) = ConnectionSupervisor::new(
            self.transport.clone(),
            pipeline,
            self.state.clone(),
            self.health.clone(),
            self.connectivity.clone(),
            self.settings.supervisor,
        );
        let supervisor = Arc::new(supervisor);

        let looper = ReliabilityLoop::new(
            supervisor.clone(),
            self.state.clone(),
            self.dedup.clone(),
            self.health.clone(),
            self.power.clone(),
            self.heartbeat.clone(),
            self.clock.clone(),
            self.settings.reliability,
        );

        let dispatch_task = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.dispatch_events(events).await }
        });
        let loop_task = tokio::spawn(async move { looper.run().await });

        RunningService {
            supervisor,
            loop_task,
            dispatch_task,
        }
    }
}

async fn stop_run<T: Transport>(run: RunningService<T>) {
    run.supervisor.shutdown().await;
    match run.loop_task.await {
        Ok(exit) => debug!(?exit, "monitoring run stopped"),
        Err(e) => error!(error = %e, "reliability loop task failed"),
    }
    if let Err(e) = run.dispatch_task.await {
        error!(error = %e, "event dispatcher task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectOptions, Session, SessionId, TransportError, TransportEvent};
    use parking_lot::Mutex;
    use rumqttc::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct CountingTransport {
        connects: Arc<AtomicUsize>,
    }

    struct Up;

    impl Transport for CountingTransport {
        type Session = Up;

        async fn connect(
            &self,
            _session: SessionId,
            _options: &ConnectOptions,
            _events: mpsc::Sender<TransportEvent>,
        ) -> Result<Up, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Up)
        }
    }

    impl Session for Up {
        async fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(self) {}
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Alert>>);

    impl AlertSink for Recorder {
        fn fire(&self, alert: &Alert) -> Result<(), AlertError> {
            self.0.lock().push(alert.clone());
            Ok(())
        }
    }

    fn location() -> Location {
        Location {
            id: "loc-1".into(),
            name: "Downtown".into(),
        }
    }

    fn channel(name: &str) -> ChannelConfig {
        ChannelConfig {
            broker_host: "broker.local".into(),
            broker_port: 1883,
            tls: false,
            channel: name.into(),
            qos: 1,
            username: None,
            password: None,
            keep_alive_secs: 30,
            client_id_prefix: "rescue".into(),
        }
    }

    async fn wait_connected(rx: &mut watch::Receiver<bool>) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_activate_connects_and_deactivate_stops() {
        let transport = CountingTransport::default();
        let monitor = RescueMonitor::builder(transport.clone()).build().unwrap();
        let mut connectivity = monitor.connectivity();

        monitor.activate(location(), channel("orders/a")).await.unwrap();
        wait_connected(&mut connectivity).await;
        assert!(monitor.is_active());
        assert!(monitor.is_running().await);

        monitor.deactivate().await.unwrap();
        assert!(!monitor.is_active());
        assert!(!monitor.is_connected());
        assert!(!monitor.is_running().await);
        assert_eq!(monitor.current_state().unwrap(), MonitorStatus::Inactive);
    }

    #[tokio::test]
    async fn test_activate_rejects_missing_config() {
        let monitor = RescueMonitor::builder(CountingTransport::default()).build().unwrap();
        let err = monitor.activate(location(), channel("")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::State(StateError::ConfigurationMissing(_))
        ));
        assert!(!monitor.is_running().await);
    }

    #[tokio::test]
    async fn test_start_resumes_only_with_state() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let transport = CountingTransport::default();

        let first = RescueMonitor::builder(transport.clone())
            .state_store(store.clone())
            .build()
            .unwrap();
        assert!(!first.start().await.unwrap());
        first.activate(location(), channel("orders/a")).await.unwrap();
        first.shutdown().await;
        assert!(first.is_active());

        // a second process over the same store picks the run back up
        let second = RescueMonitor::builder(transport.clone())
            .state_store(store)
            .build()
            .unwrap();
        let mut connectivity = second.connectivity();
        assert!(second.start().await.unwrap());
        assert!(second.start().await.unwrap());
        wait_connected(&mut connectivity).await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_test_alert_bypasses_pipeline() {
        let recorder = Arc::new(Recorder::default());
        let monitor = RescueMonitor::builder(CountingTransport::default())
            .alerts(recorder.clone())
            .build()
            .unwrap();

        let alert = monitor.trigger_test_alert().unwrap();
        assert_eq!(alert.reason, AlertReason::Test);
        assert!(alert.location.is_none());

        monitor.activate(location(), channel("orders/a")).await.unwrap();
        monitor.trigger_test_alert().unwrap();
        monitor.trigger_test_alert().unwrap();

        let alerts = recorder.0.lock();
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[2].location, Some(location()));
        drop(alerts);
        assert_eq!(
            monitor.current_state().unwrap().as_state().unwrap().last_alert_at,
            0
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness_reflects_state() {
        let monitor = RescueMonitor::builder(CountingTransport::default()).build().unwrap();
        assert_eq!(monitor.liveness().status_line, "Not monitoring");

        let mut connectivity = monitor.connectivity();
        monitor.activate(location(), channel("orders/a")).await.unwrap();
        wait_connected(&mut connectivity).await;

        let report = monitor.liveness();
        assert!(report.connected);
        assert_eq!(report.status_line, "Monitoring: Downtown");
        assert_eq!(report.process.sessions_opened, 1);
        monitor.shutdown().await;
    }
}
