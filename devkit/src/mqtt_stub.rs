/*!
Mock MQTT transport for tests without a broker

Implements `rescue_monitor::transport::Transport`. Records every connect
attempt (client id, subscriptions), fails on demand, and lets a test push
messages or cut the connection of the live session.
*/

use anyhow::Result;
use parking_lot::Mutex;
use rescue_monitor::transport::{
    ConnectOptions, Session, SessionId, Transport, TransportError, TransportEvent,
};
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub session: SessionId,
    pub client_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRecord {
    pub session: SessionId,
    pub topic: String,
    pub qos: QoS,
}

struct LiveSession {
    session: SessionId,
    topic: Option<String>,
    events: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockState {
    scripted_failures: Mutex<VecDeque<String>>,
    fail_always: AtomicBool,
    connects: Mutex<Vec<ConnectRecord>>,
    subscriptions: Mutex<Vec<SubscribeRecord>>,
    live: Mutex<Option<LiveSession>>,
}

/// Cheap to clone; every clone drives the same fake broker.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connect attempts fail with `reason`.
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut failures = self.inner.scripted_failures.lock();
        for _ in 0..count {
            failures.push_back(reason.to_string());
        }
    }

    /// Every connect attempt fails until switched off again.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.fail_always.store(unreachable, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.lock().len()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.inner.connects.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<SubscribeRecord> {
        self.inner.subscriptions.lock().clone()
    }

    /// Session id of the live connection, if any.
    pub fn live_session(&self) -> Option<SessionId> {
        self.inner
            .live
            .lock()
            .as_ref()
            .filter(|live| live.alive.load(Ordering::SeqCst))
            .map(|live| live.session)
    }

    /// Delivers `payload` on the live session's subscribed topic.
    pub async fn deliver(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let (events, event) = {
            let live = self.inner.live.lock();
            let Some(live) = live.as_ref().filter(|l| l.alive.load(Ordering::SeqCst)) else {
                anyhow::bail!("no live session to deliver on");
            };
            let Some(topic) = live.topic.clone() else {
                anyhow::bail!("live session {} has no subscription", live.session);
            };
            let event = TransportEvent::Message {
                session: live.session,
                topic,
                payload: payload.into(),
            };
            (live.events.clone(), event)
        };
        events
            .send(event)
            .await
            .map_err(|e| anyhow::anyhow!("event queue closed: {e}"))?;
        log::info!("[MOCK] delivered message");
        Ok(())
    }

    /// Cuts the live connection as a network failure would.
    pub async fn drop_connection(&self, cause: &str) -> Result<SessionId> {
        let (events, session) = {
            let live = self.inner.live.lock();
            let Some(live) = live.as_ref().filter(|l| l.alive.load(Ordering::SeqCst)) else {
                anyhow::bail!("no live session to drop");
            };
            live.alive.store(false, Ordering::SeqCst);
            (live.events.clone(), live.session)
        };
        events
            .send(TransportEvent::ConnectionLost {
                session,
                cause: cause.to_string(),
            })
            .await
            .map_err(|e| anyhow::anyhow!("event queue closed: {e}"))?;
        log::info!("[MOCK] dropped session {session}: {cause}");
        Ok(session)
    }

    fn next_failure(&self) -> Option<String> {
        if self.inner.fail_always.load(Ordering::SeqCst) {
            return Some("network unreachable".into());
        }
        self.inner.scripted_failures.lock().pop_front()
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    async fn connect(
        &self,
        session: SessionId,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<MockSession, TransportError> {
        self.inner.connects.lock().push(ConnectRecord {
            session,
            client_id: options.client_id.clone(),
            host: options.host.clone(),
            port: options.port,
        });

        if let Some(reason) = self.next_failure() {
            log::info!("[MOCK] connect {session} refused: {reason}");
            return Err(TransportError::Connect(reason));
        }

        let alive = Arc::new(AtomicBool::new(true));
        *self.inner.live.lock() = Some(LiveSession {
            session,
            topic: None,
            events,
            alive: alive.clone(),
        });
        log::info!("[MOCK] session {session} connected as {}", options.client_id);
        Ok(MockSession {
            session,
            alive,
            inner: self.inner.clone(),
        })
    }
}

pub struct MockSession {
    session: SessionId,
    alive: Arc<AtomicBool>,
    inner: Arc<MockState>,
}

impl Session for MockSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost("session closed".into()));
        }
        self.inner.subscriptions.lock().push(SubscribeRecord {
            session: self.session,
            topic: topic.to_string(),
            qos,
        });
        if let Some(live) = self.inner.live.lock().as_mut() {
            if live.session == self.session {
                live.topic = Some(topic.to_string());
            }
        }
        log::info!("[MOCK] session {} subscribed to {topic}", self.session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn disconnect(self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut live = self.inner.live.lock();
        if live.as_ref().is_some_and(|l| l.session == self.session) {
            *live = None;
        }
        log::info!("[MOCK] session {} disconnected", self.session);
    }
}
