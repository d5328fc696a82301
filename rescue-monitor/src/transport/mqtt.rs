use super::{ConnectOptions, Session, SessionId, Transport, TransportError, TransportEvent};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS,
    SubscribeReasonCode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkPhase {
    Connecting,
    Connected,
    Subscribed,
    Rejected(String),
    Lost(String),
}

impl LinkPhase {
    fn is_up(&self) -> bool {
        matches!(self, LinkPhase::Connected | LinkPhase::Subscribed)
    }
}

/// `rumqttc` backed transport. One `AsyncClient` + event loop per session;
/// the event loop never reconnects by itself, the supervisor does.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut opts = MqttOptions::new(&options.client_id, &options.host, options.port);
        opts.set_keep_alive(options.keep_alive);
        opts.set_clean_session(true);
        if let Some((user, pass)) = &options.credentials {
            opts.set_credentials(user, pass);
        }
        if options.tls {
            // certificates checked against the platform roots
            opts.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        opts
    }
}

impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn connect(
        &self,
        session: SessionId,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<MqttSession, TransportError> {
        let (client, eventloop) = AsyncClient::new(Self::mqtt_options(options), REQUEST_CAPACITY);
        let (phase_tx, mut phase_rx) = watch::channel(LinkPhase::Connecting);
        let closing = Arc::new(AtomicBool::new(false));

        debug!(
            session,
            client_id = %options.client_id,
            host = %options.host,
            port = options.port,
            tls = options.tls,
            "opening MQTT session"
        );
        let poller = PollerGuard(tokio::spawn(poll_events(
            session,
            eventloop,
            phase_tx,
            events,
            closing.clone(),
        )));

        let outcome = tokio::time::timeout(
            options.connect_timeout,
            phase_rx.wait_for(|phase| *phase != LinkPhase::Connecting),
        )
        .await
        .map_err(|_| TransportError::Timeout(options.connect_timeout))?
        .map(|phase| phase.clone());

        match outcome {
            Ok(LinkPhase::Connected) => {
                info!(session, client_id = %options.client_id, "MQTT session connected");
                Ok(MqttSession {
                    client,
                    phase: phase_rx,
                    closing,
                    poller,
                })
            }
            Ok(LinkPhase::Rejected(reason)) | Ok(LinkPhase::Lost(reason)) => {
                Err(TransportError::Connect(reason))
            }
            Ok(other) => Err(TransportError::Connect(format!("unexpected link phase {other:?}"))),
            Err(_) => Err(TransportError::Connect("event loop stopped".into())),
        }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    phase: watch::Receiver<LinkPhase>,
    closing: Arc<AtomicBool>,
    poller: PollerGuard,
}

impl Session for MqttSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let mut phase = self.phase.clone();
        let outcome = phase
            .wait_for(|p| !matches!(p, LinkPhase::Connecting | LinkPhase::Connected))
            .await
            .map(|p| p.clone());

        match outcome {
            Ok(LinkPhase::Subscribed) => {
                info!(topic, ?qos, "subscribed");
                Ok(())
            }
            Ok(LinkPhase::Rejected(reason)) => Err(TransportError::Subscribe(reason)),
            Ok(LinkPhase::Lost(reason)) => Err(TransportError::ConnectionLost(reason)),
            Ok(other) => Err(TransportError::Subscribe(format!("unexpected link phase {other:?}"))),
            Err(_) => Err(TransportError::ConnectionLost("event loop stopped".into())),
        }
    }

    fn is_connected(&self) -> bool {
        self.phase.borrow().is_up()
    }

    async fn disconnect(self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }

        let MqttSession { mut poller, .. } = self;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut poller.0).await.is_err() {
            debug!("event loop still running after disconnect, aborting it");
        }
        // guard drop aborts the poller if still alive
    }
}

struct PollerGuard(JoinHandle<()>);

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn poll_events(
    session: SessionId,
    mut eventloop: EventLoop,
    phase: watch::Sender<LinkPhase>,
    events: mpsc::Sender<TransportEvent>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    phase.send_replace(LinkPhase::Connected);
                } else {
                    phase.send_replace(LinkPhase::Rejected(format!("broker refused: {:?}", ack.code)));
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    phase.send_replace(LinkPhase::Rejected("subscription refused".into()));
                } else {
                    phase.send_replace(LinkPhase::Subscribed);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let event = TransportEvent::Message {
                    session,
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(event).await.is_err() {
                    debug!(session, "event receiver gone, stopping event loop");
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                report_loss(session, &phase, &events, &closing, "broker sent disconnect".into()).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                report_loss(session, &phase, &events, &closing, e.to_string()).await;
                return;
            }
        }
    }
}

async fn report_loss(
    session: SessionId,
    phase: &watch::Sender<LinkPhase>,
    events: &mpsc::Sender<TransportEvent>,
    closing: &AtomicBool,
    cause: String,
) {
    let was_up = phase.borrow().is_up();
    phase.send_replace(LinkPhase::Lost(cause.clone()));

    if closing.load(Ordering::SeqCst) {
        debug!(session, "event loop closed after disconnect");
        return;
    }
    if !was_up {
        debug!(session, cause = %cause, "connection attempt failed");
        return;
    }

    warn!(session, cause = %cause, "MQTT connection lost");
    let _ = events
        .send(TransportEvent::ConnectionLost { session, cause })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn options(port: u16) -> ConnectOptions {
        ConnectOptions {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            client_id: "rescue-test".into(),
            keep_alive: Duration::from_secs(30),
            credentials: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error_without_loss_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(4);
        let result = MqttTransport::new().connect(1, &options(port), tx).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connack_subscribe_publish_then_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];

            // CONNECT -> CONNACK(accepted)
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            // SUBSCRIBE -> SUBACK(qos1) echoing the packet id
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(buf[0] & 0xF0, 0x80);
            let (pkid_hi, pkid_lo) = (buf[2], buf[3]);
            assert!(n >= 4);
            socket
                .write_all(&[0x90, 0x03, pkid_hi, pkid_lo, 0x01])
                .await
                .unwrap();

            // PUBLISH qos0 on topic "t" with payload "hi"
            socket
                .write_all(&[0x30, 0x05, 0x00, 0x01, b't', b'h', b'i'])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            // dropping the socket ends the connection
        });

        let (tx, mut rx) = mpsc::channel(4);
        let session = MqttTransport::new().connect(7, &options(port), tx).await.unwrap();
        assert!(session.is_connected());
        session.subscribe("t", QoS::AtLeastOnce).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(
            message,
            TransportEvent::Message {
                session: 7,
                topic: "t".into(),
                payload: b"hi".to_vec(),
            }
        );

        let lost = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(lost, TransportEvent::ConnectionLost { session: 7, .. }));
        assert!(!session.is_connected());

        broker.await.unwrap();
        session.disconnect().await;
    }
}
