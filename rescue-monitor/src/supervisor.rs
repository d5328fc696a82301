/**
 * CONNECTION SUPERVISOR - owns the one live subscription
 *
 * ROLE :
 * Keeps at most one transport session open, reports connectivity, counts
 * every failed attempt and every lost connection in the persisted state.
 *
 * HOW IT WORKS :
 *   Disconnected -> Connecting -> Connected -> Disconnected -> ...
 *   any phase    -> Closed (terminal)
 *
 * - `ensure_connected` never retries; the loop's next tick is the retry
 * - Connect + subscribe race a timeout and the shutdown signal
 * - Every attempt gets a new session id; events of older sessions are stale
 * - The session lock is only held to swap the slot, never across a connect,
 *   so `shutdown` cannot deadlock behind an in-flight attempt
 */

use crate::health::HealthTracker;
use crate::models::ChannelConfig;
use crate::pipeline::{MessagePipeline, Outcome};
use crate::state::MonitorStateStore;
use crate::transport::{
    ConnectOptions, Session, SessionId, Transport, TransportError, TransportEvent,
    DEFAULT_CONNECT_TIMEOUT,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    AlreadyConnected,
    Connected(SessionId),
    Failed(TransportError),
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub connect_timeout: Duration,
    pub event_queue_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_queue_capacity: 64,
        }
    }
}

struct ActiveSession<S> {
    id: SessionId,
    session: S,
}

pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    events: mpsc::Sender<TransportEvent>,
    phase: Mutex<SupervisorPhase>,
    current: AtomicU64,
    next_session: AtomicU64,
    session: tokio::sync::Mutex<Option<ActiveSession<T::Session>>>,
    // serializes ensure_connected callers
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    connectivity: Arc<watch::Sender<bool>>,
    pipeline: Arc<MessagePipeline>,
    state: Arc<MonitorStateStore>,
    health: HealthTracker,
    settings: SupervisorSettings,
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Returns the supervisor and the receiving end of its event queue,
    /// to be drained by [`ConnectionSupervisor::dispatch_events`].
    pub fn new(
        transport: T,
        pipeline: Arc<MessagePipeline>,
        state: Arc<MonitorStateStore>,
        health: HealthTracker,
        connectivity: Arc<watch::Sender<bool>>,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(settings.event_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let supervisor = Self {
            transport,
            events,
            phase: Mutex::new(SupervisorPhase::Disconnected),
            current: AtomicU64::new(0),
            next_session: AtomicU64::new(0),
            session: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown,
            connectivity,
            pipeline,
            state,
            health,
            settings,
        };
        (supervisor, rx)
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.phase.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == SupervisorPhase::Connected
    }

    pub fn current_session(&self) -> SessionId {
        self.current.load(Ordering::SeqCst)
    }

    /// Flips to `true` once [`ConnectionSupervisor::shutdown`] ran.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Moves to `to` unless closed. Returns false when closed.
    fn set_phase(&self, to: SupervisorPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase == SupervisorPhase::Closed {
            return false;
        }
        *phase = to;
        true
    }

    fn publish_connectivity(&self, connected: bool) {
        self.connectivity.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    fn count_reconnect(&self) {
        match self.state.increment_reconnect() {
            Ok(Some(count)) => debug!(count, "reconnect counted"),
            Ok(None) => debug!("monitoring inactive, reconnect not counted"),
            Err(e) => error!(error = %e, "failed to count reconnect"),
        }
    }

    /// Makes sure a subscribed session exists for `config`.
    pub async fn ensure_connected(&self, config: &ChannelConfig) -> ConnectOutcome {
        let _serial = self.connect_lock.lock().await;

        match self.phase() {
            SupervisorPhase::Closed => return ConnectOutcome::Closed,
            SupervisorPhase::Connected => {
                let alive = self
                    .session
                    .lock()
                    .await
                    .as_ref()
                    .is_some_and(|active| active.session.is_connected());
                if alive {
                    return ConnectOutcome::AlreadyConnected;
                }
                // the loss is still queued; count it here, the queued copy
                // will belong to a superseded session
                warn!(session = self.current_session(), "session dropped without notice");
                self.health.record_connection_lost();
                self.count_reconnect();
            }
            SupervisorPhase::Disconnected | SupervisorPhase::Connecting => {}
        }

        if !self.set_phase(SupervisorPhase::Connecting) {
            return ConnectOutcome::Closed;
        }
        self.publish_connectivity(false);

        let previous = self.session.lock().await.take();
        if let Some(previous) = previous {
            debug!(session = previous.id, "tearing down previous session");
            previous.session.disconnect().await;
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.store(id, Ordering::SeqCst);
        let options = ConnectOptions::from_channel(config, self.settings.connect_timeout);
        info!(
            session = id,
            client_id = %options.client_id,
            broker = %format!("{}:{}", config.broker_host, config.broker_port),
            channel = %config.channel,
            "connecting"
        );

        let attempt = async {
            let session = self.transport.connect(id, &options, self.events.clone()).await?;
            match session.subscribe(&config.channel, config.mqtt_qos()).await {
                Ok(()) => Ok(session),
                Err(e) => {
                    session.disconnect().await;
                    Err(e)
                }
            }
        };

        let result = tokio::select! {
            result = tokio::time::timeout(self.settings.connect_timeout, attempt) => result,
            _ = wait_closed(self.shutdown.subscribe()) => {
                info!(session = id, "connect aborted by shutdown");
                return ConnectOutcome::Closed;
            }
        };

        let session = match result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return self.connect_failed(id, e),
            Err(_) => return self.connect_failed(id, TransportError::Timeout(self.settings.connect_timeout)),
        };

        let mut slot = self.session.lock().await;
        if !self.set_phase(SupervisorPhase::Connected) {
            drop(slot);
            session.disconnect().await;
            return ConnectOutcome::Closed;
        }
        *slot = Some(ActiveSession { id, session });
        drop(slot);

        self.health.record_session_opened();
        self.publish_connectivity(true);
        info!(session = id, channel = %config.channel, "connected and subscribed");
        ConnectOutcome::Connected(id)
    }

    fn connect_failed(&self, id: SessionId, e: TransportError) -> ConnectOutcome {
        self.set_phase(SupervisorPhase::Disconnected);
        self.publish_connectivity(false);
        self.health.record_connect_failure();
        self.count_reconnect();
        warn!(session = id, error = %e, "connect attempt failed, retrying next tick");
        ConnectOutcome::Failed(e)
    }

    /// Handles the loss of `session`. Losses of superseded sessions and
    /// losses while not connected are ignored.
    pub fn on_connection_lost(&self, session: SessionId, cause: &str) -> bool {
        if session != self.current_session() {
            debug!(session, current = self.current_session(), "ignoring loss of superseded session");
            return false;
        }
        {
            let mut phase = self.phase.lock();
            if *phase != SupervisorPhase::Connected {
                debug!(session, phase = ?*phase, "ignoring loss outside connected phase");
                return false;
            }
            *phase = SupervisorPhase::Disconnected;
        }

        self.publish_connectivity(false);
        self.health.record_connection_lost();
        self.count_reconnect();
        warn!(session, cause, "connection lost, reconnecting next tick");
        true
    }

    pub fn on_message(&self, session: SessionId, payload: &[u8]) -> Option<Outcome> {
        if self.phase() == SupervisorPhase::Closed {
            debug!(session, "supervisor closed, message dropped");
            return None;
        }
        let outcome = self.pipeline.process(payload);
        debug!(session, ?outcome, "message processed");
        Some(outcome)
    }

    pub fn dispatch(&self, event: TransportEvent) -> Option<Outcome> {
        match event {
            TransportEvent::Message { session, payload, .. } => self.on_message(session, &payload),
            TransportEvent::ConnectionLost { session, cause } => {
                self.on_connection_lost(session, &cause);
                None
            }
        }
    }

    /// Drains the event queue until the supervisor closes.
    pub async fn dispatch_events(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let closed = wait_closed(self.shutdown.subscribe());
        tokio::pin!(closed);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.dispatch(event);
                    }
                    None => break,
                },
                _ = &mut closed => break,
            }
        }
        debug!("event dispatcher stopped");
    }

    /// Closes the supervisor for good. Safe to call repeatedly and while a
    /// connect is in flight.
    pub async fn shutdown(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase == SupervisorPhase::Closed {
                return;
            }
            *phase = SupervisorPhase::Closed;
        }
        self.shutdown.send_replace(true);

        let active = self.session.lock().await.take();
        if let Some(active) = active {
            active.session.disconnect().await;
            debug!(session = active.id, "session released");
        }
        self.publish_connectivity(false);
        info!("connection supervisor closed");
    }
}

async fn wait_closed(mut signal: watch::Receiver<bool>) {
    loop {
        let closed = *signal.borrow_and_update();
        if closed {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}
