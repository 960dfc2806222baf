//! End-to-end tests: client and server sessions talking over in-memory pipe transports.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use fixp::auth::DirectoryAuthenticator;
use fixp::config::SessionConfig;
use fixp::engine::Engine;
use fixp::error::FixpError;
use fixp::messages::{peek_session_message, FlowType, FrameSplitter, MessageHeader, TerminationCode};
use fixp::session::{MessageConsumer, Session, SessionState};
use fixp::transport::pipe::PipeTransport;
use fixp::transport::shared::{SharedTransport, SharedTransportHandle};
use fixp::transport::{Transport, TransportConsumer};

const CREDENTIALS: &[u8] = b"trader-1";

#[derive(Default)]
struct Collector {
    received: Mutex<Vec<(Bytes, u64)>>,
}

impl Collector {
    fn seq_nos(&self) -> Vec<u64> {
        self.received.lock().unwrap().iter().map(|(_, seq_no)| *seq_no).collect()
    }

    fn messages(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }
}

impl MessageConsumer for Collector {
    fn accept(&self, message: &[u8], _session_id: Uuid, seq_no: u64) {
        self.received.lock().unwrap().push((Bytes::copy_from_slice(message), seq_no));
    }
}

fn app_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    MessageHeader { block_length: payload.len() as u16, template_id: 3, schema_id: 77, version: 0 }.ser(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

async fn server_engine() -> Arc<Engine> {
    let authenticator = DirectoryAuthenticator::new();
    authenticator.add(CREDENTIALS);
    let engine = Engine::with_defaults(Some(Arc::new(authenticator))).unwrap();
    engine.open().await.unwrap();
    engine
}

async fn client_engine() -> Arc<Engine> {
    let engine = Engine::with_defaults(None).unwrap();
    engine.open().await.unwrap();
    engine
}

fn client_config(credentials: &'static [u8], flow: FlowType) -> SessionConfig {
    let mut config = SessionConfig::client(credentials, flow);
    config.keepalive_interval = Duration::from_millis(100);
    config
}

fn server_config(flow: FlowType) -> SessionConfig {
    let mut config = SessionConfig::server(flow);
    config.keepalive_interval = Duration::from_millis(100);
    config
}

async fn eventually(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", description);
}

struct Pair {
    client: Arc<Session>,
    server: Arc<Session>,
    client_received: Arc<Collector>,
    server_received: Arc<Collector>,
}

async fn connect(client_transport: Arc<dyn Transport>, server_transport: Arc<dyn Transport>, client_flow: FlowType, server_flow: FlowType) -> Pair {
    let client_received = Arc::new(Collector::default());
    let server_received = Arc::new(Collector::default());
    let client = Session::new(Arc::new(client_config(CREDENTIALS, client_flow)), client_engine().await, client_transport, client_received.clone()).unwrap();
    let server = Session::new(Arc::new(server_config(server_flow)), server_engine().await, server_transport, server_received.clone()).unwrap();

    let opened = tokio::time::timeout(Duration::from_millis(3000), async {
        tokio::join!(server.open(), client.open())
    }).await;
    let (server_result, client_result) = opened.expect("sessions were not established within 3000ms");
    server_result.unwrap();
    client_result.unwrap();

    Pair { client, server, client_received, server_received }
}

#[tokio::test]
async fn test_establish_and_exchange() {
    let (a, b) = PipeTransport::pair(64);
    let pair = connect(a, b, FlowType::Recoverable, FlowType::Idempotent).await;

    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.state(), SessionState::Established);
    assert_eq!(pair.server.session_id(), pair.client.session_id());
    assert_eq!(pair.server.inbound_flow(), Some(FlowType::Recoverable));
    assert_eq!(pair.client.inbound_flow(), Some(FlowType::Idempotent));

    for i in 0..10u8 {
        pair.client.send(&app_message(&[i])).unwrap();
    }
    pair.server.send_batch(&[&app_message(b"x")[..], &app_message(b"y")[..]]).unwrap();

    eventually("the server to receive all messages", || pair.server_received.seq_nos().len() == 10).await;
    eventually("the client to receive all messages", || pair.client_received.seq_nos().len() == 2).await;

    assert_eq!(pair.server_received.seq_nos(), (1..=10).collect::<Vec<u64>>());
    assert_eq!(pair.server_received.messages()[3], app_message(&[3]));
    assert_eq!(pair.client_received.seq_nos(), vec![1, 2]);

    // idle sessions stay up on heartbeats alone
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.state(), SessionState::Established);
}

#[tokio::test]
async fn test_unknown_credentials() {
    let (a, b) = PipeTransport::pair(64);
    let client = Session::new(Arc::new(client_config(b"intruder", FlowType::Idempotent)), client_engine().await, a, Arc::new(Collector::default())).unwrap();
    let server = Session::new(Arc::new(server_config(FlowType::Idempotent)), server_engine().await, b, Arc::new(Collector::default())).unwrap();

    let (server_result, client_result) = tokio::join!(server.open(), client.open());

    assert!(matches!(client_result, Err(FixpError::Authentication(_))));
    assert!(matches!(server_result, Err(FixpError::Authentication(_))));
    assert_eq!(client.state(), SessionState::Terminated);
    assert_eq!(client.termination_code(), Some(TerminationCode::Unauthorized));
    assert_eq!(server.termination_code(), Some(TerminationCode::Unauthorized));
}

#[tokio::test]
async fn test_close() {
    let (a, b) = PipeTransport::pair(64);
    let pair = connect(a, b, FlowType::Idempotent, FlowType::Idempotent).await;

    pair.client.close().await.unwrap();

    assert_eq!(pair.client.state(), SessionState::Terminated);
    assert_eq!(pair.client.termination_code(), Some(TerminationCode::Finished));
    eventually("the server to terminate", || pair.server.state() == SessionState::Terminated).await;
    assert_eq!(pair.server.termination_code(), Some(TerminationCode::Finished));
    assert!(matches!(pair.client.send(&app_message(b"late")), Err(FixpError::InvalidState { .. })));
}

/// Swallows the next write that consists of application frames only
struct DroppingTransport {
    inner: Arc<PipeTransport>,
    drop_next: AtomicBool,
}

impl DroppingTransport {
    fn is_application_only(buf: &[u8]) -> bool {
        FrameSplitter::new(buf)
            .all(|body| body.map(|body| peek_session_message(body).is_none()).unwrap_or(false))
    }
}

#[async_trait]
impl Transport for DroppingTransport {
    async fn open(&self, consumer: Arc<dyn TransportConsumer>) -> Result<(), FixpError> {
        self.inner.open(consumer).await
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if Self::is_application_only(buf) && self.drop_next.swap(false, Ordering::AcqRel) {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[tokio::test]
async fn test_recoverable_gap_is_filled() {
    let (a, b) = PipeTransport::pair(64);
    let client_transport = Arc::new(DroppingTransport { inner: a, drop_next: AtomicBool::new(false) });
    let pair = connect(client_transport.clone(), b, FlowType::Recoverable, FlowType::Idempotent).await;

    for i in 1..=4u8 {
        pair.client.send(&app_message(&[i])).unwrap();
    }
    client_transport.drop_next.store(true, Ordering::Release);
    assert_eq!(pair.client.send(&app_message(&[5])).unwrap(), 5);
    assert!(!client_transport.drop_next.load(Ordering::Acquire));

    // the client's next heartbeat announces #6, the server requests #5 and the client resends it
    eventually("the gap to be filled", || pair.server_received.seq_nos().contains(&5)).await;

    let received = pair.server_received.received.lock().unwrap().clone();
    let (message, _) = received.iter().find(|(_, seq_no)| *seq_no == 5).unwrap();
    assert_eq!(message, &app_message(&[5]));
    assert_eq!(received.iter().filter(|(_, seq_no)| *seq_no == 5).count(), 1);
    assert_eq!(pair.server.state(), SessionState::Established);
}

#[tokio::test]
async fn test_sessions_over_a_shared_transport() {
    let (a, b) = PipeTransport::pair(64);
    let client_shared = SharedTransport::new(a);
    let server_shared = SharedTransport::new(b);

    let server_engine = server_engine().await;
    let server_sessions: Arc<Mutex<Vec<(Arc<Session>, Arc<Collector>)>>> = Default::default();
    let factory_sessions = server_sessions.clone();
    server_shared.set_new_session_factory(Box::new(move |_: Uuid, handle: Arc<SharedTransportHandle>| -> Option<Arc<dyn TransportConsumer>> {
        let received = Arc::new(Collector::default());
        let session = Session::new(Arc::new(server_config(FlowType::Idempotent)), server_engine.clone(), handle, received.clone()).ok()?;
        factory_sessions.lock().unwrap().push((session.clone(), received));
        Some(session)
    }));
    server_shared.listen().await.unwrap();

    let client_engine = client_engine().await;
    let mut clients = Vec::new();
    for _ in 0..2 {
        let session_id = Uuid::new_v4();
        let mut config = client_config(CREDENTIALS, FlowType::Idempotent);
        config.session_id = Some(session_id);
        let client = Session::new(Arc::new(config), client_engine.clone(), client_shared.handle(session_id), Arc::new(Collector::default())).unwrap();
        client.open().await.unwrap();
        clients.push(client);
    }
    assert_eq!(client_engine.sessions().len(), 2);

    for round in 0..3u8 {
        for (i, client) in clients.iter().enumerate() {
            client.send(&app_message(&[i as u8, round])).unwrap();
        }
    }

    eventually("both server sessions to receive their messages", || {
        server_sessions.lock().unwrap().iter().all(|(_, received)| received.seq_nos().len() == 3)
    }).await;

    let server_sessions = server_sessions.lock().unwrap();
    assert_eq!(server_sessions.len(), 2);
    for (i, client) in clients.iter().enumerate() {
        let (_, received) = server_sessions.iter()
            .find(|(session, _)| session.session_id() == client.session_id())
            .unwrap();
        assert_eq!(received.messages(), (0..3u8).map(|round| app_message(&[i as u8, round])).collect::<Vec<_>>());
        assert_eq!(received.seq_nos(), vec![1, 2, 3]);
    }
}
