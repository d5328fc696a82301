/**
 * TRANSPORT - the subscription client seen by the supervisor
 *
 * ROLE :
 * Hides the MQTT client behind two small traits so the supervisor can be
 * driven by a scripted transport in tests.
 *
 * HOW IT WORKS :
 * - `Transport::connect` opens one session and resolves once the broker
 *   accepted it (or failed)
 * - Callbacks become `TransportEvent`s on a bounded mpsc channel, tagged
 *   with the session id so the consumer can drop events of old sessions
 * - `Session::disconnect` consumes the session; no loss event follows it
 */

pub mod mqtt;

pub use mqtt::MqttTransport;

use crate::models::ChannelConfig;
use rumqttc::QoS;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifies one connection attempt. Strictly increasing per supervisor.
pub type SessionId = u64;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    /// Options for one attempt. Each call draws a fresh client id.
    pub fn from_channel(config: &ChannelConfig, connect_timeout: Duration) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Self {
            host: config.broker_host.clone(),
            port: config.broker_port,
            tls: config.tls,
            client_id: format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4().simple()),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            credentials,
            connect_timeout,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("username", &self.credentials.as_ref().map(|(u, _)| u))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message {
        session: SessionId,
        topic: String,
        payload: Vec<u8>,
    },
    ConnectionLost {
        session: SessionId,
        cause: String,
    },
}

impl TransportEvent {
    pub fn session(&self) -> SessionId {
        match self {
            TransportEvent::Message { session, .. } => *session,
            TransportEvent::ConnectionLost { session, .. } => *session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Opens a session. Messages and the eventual loss of the connection
    /// are reported on `events`.
    fn connect(
        &self,
        session: SessionId,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

pub trait Session: Send + Sync + 'static {
    /// Resolves once the broker acknowledged the subscription.
    fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn is_connected(&self) -> bool;

    fn disconnect(self) -> impl Future<Output = ()> + Send;
}
