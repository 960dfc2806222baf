//! The session state machine.
//!
//! A session moves through negotiation (identity and credentials) and establishment (flow types
//!  and keepalive intervals) before application messages flow. Clients drive both exchanges,
//!  servers respond to them.
//!
//! ```ascii
//!  client                                    server
//!    |  Negotiate(id, credentials, flow)  ->   |  validate credentials
//!    |  <- NegotiationResponse(flow)           |
//!    |  Establish(keepalive, next seq no) ->   |
//!    |  <- EstablishmentAck(keepalive)         |
//!    |          ... application ...            |
//!    |  Terminate(Finished)               ->   |
//!    |  <- Terminate(Finished)                 |
//! ```
//!
//! All transitions happen under the session's lock, and only the session itself changes its
//!  state. Inbound frames arrive through the [TransportConsumer] implementation, timers and
//!  flow failures arrive as reactor events.

pub mod sessions;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, SessionRole};
use crate::engine::Engine;
use crate::error::FixpError;
use crate::flow::{create_flow_sender, FlowContext, FlowSender};
use crate::messages::{decode_frame, FlowType, Frame, FrameSplitter, SessionMessage, TerminationCode};
use crate::reactor::{Event, RetransmitRequestData, ServiceEventKind, SessionEventKind, Subscription, TimerSchedule, Topic};
use crate::sequencer::{Gap, ReceiveSequencer, FIRST_SEQ_NO};
use crate::transport::{write_with_retry, Transport, TransportConsumer};
use crate::util::safe_converter::SafeCast;
use crate::util::timestamp_nanos;

pub use sessions::Sessions;
pub use state::SessionState;

/// Receives the application messages of a session, in sequence. `seq_no` is 0 for unsequenced
///  flows.
#[cfg_attr(test, automock)]
pub trait MessageConsumer: Send + Sync + 'static {
    fn accept(&self, message: &[u8], session_id: Uuid, seq_no: u64);
}

/// The view of a session that the registry and the retransmitter work with
#[cfg_attr(test, automock)]
pub trait SessionHandle: Send + Sync + 'static {
    fn state(&self) -> SessionState;

    /// Resends `messages[offset..offset+count]` as the messages starting at `from_seq_no`, in
    ///  response to a RetransmitRequest with timestamp `request_timestamp`
    fn resend(&self, messages: &[Bytes], offset: usize, count: usize, from_seq_no: u64, request_timestamp: u64) -> Result<(), FixpError>;
}

struct PeerMonitor {
    timer: TimerSchedule,
    subscription: Subscription,
}

struct SessionInner {
    session_id: Option<Uuid>,
    state: SessionState,
    termination_code: Option<TerminationCode>,
    inbound_flow: Option<FlowType>,
    receiver: ReceiveSequencer,
    outbound: Option<Arc<dyn FlowSender>>,
    /// client: the timestamp of the Negotiate / Establish we sent
    negotiate_timestamp: u64,
    establish_timestamp: u64,
    received_since_tick: bool,
    missed_ticks: u32,
    peer_monitor: Option<PeerMonitor>,
    suspended_subscription: Option<Subscription>,
    registered: bool,
}

pub struct Session {
    config: Arc<SessionConfig>,
    engine: Arc<Engine>,
    transport: Arc<dyn Transport>,
    consumer: Arc<dyn MessageConsumer>,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    transport_opened: AtomicBool,
    myself: Weak<Session>,
}

impl Session {
    pub fn new(config: Arc<SessionConfig>, engine: Arc<Engine>, transport: Arc<dyn Transport>, consumer: Arc<dyn MessageConsumer>) -> Result<Arc<Session>, FixpError> {
        config.validate().map_err(FixpError::Config)?;

        let session_id = match config.role {
            SessionRole::Client { .. } => Some(config.session_id.unwrap_or_else(Uuid::new_v4)),
            SessionRole::Server => None,
        };

        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        Ok(Arc::new_cyclic(|myself| Session {
            config,
            engine,
            transport,
            consumer,
            inner: Mutex::new(SessionInner {
                session_id,
                state: SessionState::Uninitialized,
                termination_code: None,
                inbound_flow: None,
                receiver: ReceiveSequencer::new(FlowType::None),
                outbound: None,
                negotiate_timestamp: 0,
                establish_timestamp: 0,
                received_since_tick: false,
                missed_ticks: 0,
                peer_monitor: None,
                suspended_subscription: None,
                registered: false,
            }),
            state_tx,
            transport_opened: AtomicBool::new(false),
            myself: myself.clone(),
        }))
    }

    /// `None` for a server session that did not receive a Negotiate yet
    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session_id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Observes state transitions, e.g. for waiting until the session is terminated
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn termination_code(&self) -> Option<TerminationCode> {
        self.lock().termination_code
    }

    /// The peer's flow type, known once negotiation completed
    pub fn inbound_flow(&self) -> Option<FlowType> {
        self.lock().inbound_flow
    }

    pub fn outbound_flow(&self) -> FlowType {
        self.config.outbound_flow
    }

    /// The sequence number the next outbound message will get
    pub fn next_seq_no(&self) -> u64 {
        self.lock().outbound.as_ref()
            .map(|flow| flow.next_seq_no())
            .unwrap_or(FIRST_SEQ_NO)
    }

    /// Opens the transport and, for clients, starts negotiation. Completes when the session is
    ///  established, failing if it is terminated instead or if establishment takes longer than
    ///  the configured negotiation timeout.
    pub async fn open(&self) -> Result<(), FixpError> {
        if self.transport_opened.swap(true, Ordering::AcqRel) {
            return Err(FixpError::InvalidState { operation: "open", state: self.state() });
        }

        let myself: Arc<dyn TransportConsumer> = self.myself.upgrade()
            .ok_or(FixpError::Closed("session"))?;
        if let Err(e) = self.transport.open(myself).await {
            warn!("session {:?}: opening the transport failed: {}", self.session_id(), e);
            self.terminate(TerminationCode::TransportFailure, None, false);
            return Err(e);
        }

        if let SessionRole::Client { credentials } = &self.config.role {
            self.start_negotiation(credentials.clone())?;
        }

        self.await_established().await
    }

    fn start_negotiation(&self, credentials: Bytes) -> Result<(), FixpError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Uninitialized {
            return Err(FixpError::InvalidState { operation: "open", state: inner.state });
        }
        let Some(session_id) = inner.session_id else {
            return Err(FixpError::Protocol("client session without id".to_string()));
        };

        if let Err(e) = self.register(&mut inner, session_id) {
            self.terminate_locked(&mut inner, TerminationCode::Unspecified, None, false);
            return Err(e);
        }

        let timestamp = timestamp_nanos();
        inner.negotiate_timestamp = timestamp;
        debug!("session {}: negotiating", session_id);
        let negotiate = SessionMessage::Negotiate {
            session_id,
            timestamp,
            client_flow: self.config.outbound_flow,
            credentials,
        };
        if let Err(e) = self.write_control(&negotiate) {
            self.terminate_locked(&mut inner, TerminationCode::TransportFailure, None, false);
            return Err(e);
        }
        self.set_state(&mut inner, SessionState::Negotiating);
        Ok(())
    }

    async fn await_established(&self) -> Result<(), FixpError> {
        let mut state_rx = self.state_tx.subscribe();
        let wait_for = async {
            state_rx.wait_for(|s| s.is_established() || s.is_terminated()).await
                .map(|s| *s)
        };

        match tokio::time::timeout(self.config.negotiation_timeout, wait_for).await {
            Ok(Ok(SessionState::Established)) => Ok(()),
            Ok(_) => Err(self.termination_error()),
            Err(_) => {
                warn!("session {:?}: not established after {:?}", self.session_id(), self.config.negotiation_timeout);
                self.terminate(TerminationCode::Unspecified, Some("establishment timed out"), true);
                Err(FixpError::Timeout(format!("session was not established within {:?}", self.config.negotiation_timeout)))
            }
        }
    }

    fn termination_error(&self) -> FixpError {
        let inner = self.lock();
        match (inner.termination_code, inner.session_id) {
            (Some(TerminationCode::Unauthorized), Some(session_id)) => FixpError::Authentication(session_id),
            (Some(code), _) => FixpError::Terminated(code),
            (None, _) => FixpError::InvalidState { operation: "open", state: inner.state },
        }
    }

    pub fn send(&self, message: &[u8]) -> Result<u64, FixpError> {
        self.established_flow("send")?
            .send(message)
    }

    /// Sends the messages in a single transport write, returning the sequence number of the
    ///  last one
    pub fn send_batch(&self, messages: &[&[u8]]) -> Result<u64, FixpError> {
        self.established_flow("send")?
            .send_batch(messages)
    }

    fn established_flow(&self, operation: &'static str) -> Result<Arc<dyn FlowSender>, FixpError> {
        let inner = self.lock();
        match (&inner.outbound, inner.state) {
            (Some(flow), SessionState::Established) => Ok(flow.clone()),
            (_, state) => Err(FixpError::InvalidState { operation, state }),
        }
    }

    /// Terminates the session gracefully: an established session sends Terminate and waits for
    ///  the peer's Terminate (up to the finalize timeout), a session that is not established yet
    ///  is terminated right away
    pub async fn close(&self) -> Result<(), FixpError> {
        let flow = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Terminated => return Ok(()),
                SessionState::Finalizing => None,
                SessionState::Established => {
                    self.set_state(&mut inner, SessionState::Finalizing);
                    inner.outbound.clone()
                }
                _ => {
                    self.terminate_locked(&mut inner, TerminationCode::Finished, None, true);
                    return Ok(());
                }
            }
        };

        if let Some(flow) = flow {
            if let Err(e) = flow.send_end_of_stream() {
                warn!("session {:?}: sending Terminate failed: {}", self.session_id(), e);
                self.terminate(TerminationCode::TransportFailure, None, false);
                return Ok(());
            }
        }

        let mut state_rx = self.state_tx.subscribe();
        let finalized = tokio::time::timeout(self.config.finalize_timeout, async {
            state_rx.wait_for(|s| s.is_terminated()).await.map(|_| ())
        }).await;
        if finalized.is_err() {
            debug!("session {:?}: peer did not confirm termination within {:?}", self.session_id(), self.config.finalize_timeout);
            self.terminate(TerminationCode::Finished, None, false);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        trace!("session {:?}: {:?} -> {:?}", inner.session_id, inner.state, state);
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn write_control(&self, message: &SessionMessage) -> Result<(), FixpError> {
        let mut buf = BytesMut::with_capacity(64);
        message.ser_framed(&mut buf);
        write_with_retry(self.transport.as_ref(), &buf, self.config.max_write_retries)?;
        Ok(())
    }

    fn register(&self, inner: &mut SessionInner, session_id: Uuid) -> Result<(), FixpError> {
        let myself: Arc<dyn SessionHandle> = self.myself.upgrade()
            .ok_or(FixpError::Closed("session"))?;
        self.engine.sessions().add_session(session_id, myself)?;
        inner.registered = true;

        let session = self.myself.clone();
        let subscription = self.engine.reactor().subscribe(
            Topic::session(session_id, SessionEventKind::Suspended),
            move |_: &Topic, event: &Event| -> anyhow::Result<()> {
                if let (Some(session), Event::SessionSuspended { reason, .. }) = (session.upgrade(), event) {
                    debug!("session {}: outbound flow suspended: {}", session_id, reason);
                    session.terminate(TerminationCode::TransportFailure, Some(reason.as_str()), false);
                }
                Ok(())
            });
        inner.suspended_subscription = Some(subscription);
        Ok(())
    }

    fn terminate(&self, code: TerminationCode, reason: Option<&str>, notify_peer: bool) {
        let mut inner = self.lock();
        self.terminate_locked(&mut inner, code, reason, notify_peer);
    }

    /// Releases all of the session's resources. `notify_peer` sends a Terminate with `code`
    ///  first, which is best effort.
    fn terminate_locked(&self, inner: &mut SessionInner, code: TerminationCode, reason: Option<&str>, notify_peer: bool) {
        if inner.state == SessionState::Terminated {
            return;
        }

        if let Some(flow) = inner.outbound.take() {
            flow.shutdown();
        }
        if let (true, Some(session_id)) = (notify_peer, inner.session_id) {
            let terminate = SessionMessage::Terminate { session_id, code, reason: reason.map(str::to_string) };
            if let Err(e) = self.write_control(&terminate) {
                debug!("session {}: Terminate could not be sent: {}", session_id, e);
            }
        }

        inner.termination_code = Some(code);
        self.set_state(inner, SessionState::Terminated);

        if let Some(monitor) = inner.peer_monitor.take() {
            monitor.timer.cancel();
            monitor.subscription.unsubscribe();
        }
        if let Some(subscription) = inner.suspended_subscription.take() {
            subscription.unsubscribe();
        }
        self.transport.close();

        match inner.session_id {
            Some(session_id) => {
                if inner.registered {
                    self.engine.sessions().remove_session(&session_id);
                    inner.registered = false;
                }
                self.engine.reactor().post(
                    Topic::session(session_id, SessionEventKind::Terminated),
                    Event::SessionTerminated { session_id, code },
                );
                info!("session {}: terminated with {:?}{}", session_id, code, reason.map(|r| format!(" ({})", r)).unwrap_or_default());
            }
            None => info!("unidentified session terminated with {:?}", code),
        }
    }

    /// An unexpected or malformed frame ends the session
    fn protocol_violation(&self, inner: &mut SessionInner, description: &str) {
        warn!("session {:?}: {} - terminating", inner.session_id, description);
        self.terminate_locked(inner, TerminationCode::Malformed, Some(description), true);
    }

    fn on_session_message(&self, message: SessionMessage) {
        let mut inner = self.lock();
        trace!("session {:?}: received {:?} in state {:?}", inner.session_id, message.template_id(), inner.state);

        if inner.state == SessionState::Terminated {
            debug!("session {:?}: dropping {:?} after termination", inner.session_id, message.template_id());
            return;
        }
        if let Some(session_id) = inner.session_id {
            if message.session_id() != session_id {
                self.protocol_violation(&mut inner, &format!("received a frame for session {}", message.session_id()));
                return;
            }
        }

        let is_client = self.config.is_client();
        match (inner.state, message) {
            (SessionState::Uninitialized, SessionMessage::Negotiate { session_id, timestamp, client_flow, credentials }) if !is_client => {
                self.on_negotiate(&mut inner, session_id, timestamp, client_flow, credentials);
            }
            (SessionState::Negotiating, SessionMessage::NegotiationResponse { request_timestamp, server_flow, .. }) if is_client => {
                self.on_negotiation_response(&mut inner, request_timestamp, server_flow);
            }
            (SessionState::Establishing, SessionMessage::Establish { timestamp, keepalive_millis, next_seq_no, .. }) if !is_client => {
                self.on_establish(&mut inner, timestamp, keepalive_millis, next_seq_no);
            }
            (SessionState::Establishing, SessionMessage::EstablishmentAck { request_timestamp, keepalive_millis, .. }) if is_client => {
                self.on_establishment_ack(&mut inner, request_timestamp, keepalive_millis);
            }
            (SessionState::Negotiating, SessionMessage::NegotiationReject { code, reason, .. }) |
            (SessionState::Establishing, SessionMessage::EstablishmentReject { code, reason, .. }) if is_client => {
                warn!("session {:?}: rejected by the server with {:?}", inner.session_id, code);
                self.terminate_locked(&mut inner, code, reason.as_deref(), false);
            }
            (SessionState::Established | SessionState::Finalizing, SessionMessage::Sequence { next_seq_no, .. }) => {
                self.on_sequence(&mut inner, next_seq_no);
            }
            (SessionState::Established | SessionState::Finalizing, SessionMessage::Retransmission { next_seq_no, count, .. }) => {
                debug!("session {:?}: receiving {} retransmitted messages from #{}", inner.session_id, count, next_seq_no);
                inner.receiver.on_retransmission(next_seq_no, count);
            }
            (SessionState::Established, SessionMessage::RetransmitRequest { timestamp, from_seq_no, count, .. }) => {
                self.on_retransmit_request(&mut inner, timestamp, from_seq_no, count);
            }
            (SessionState::Established | SessionState::Finalizing, SessionMessage::NotApplied { session_id, from_seq_no, count }) => {
                warn!("session {}: peer did not apply {} messages from #{}", session_id, count, from_seq_no);
                self.engine.reactor().post(
                    Topic::session(session_id, SessionEventKind::NotApplied),
                    Event::NotApplied { session_id, from_seq_no, count },
                );
            }
            (SessionState::Established | SessionState::Finalizing, SessionMessage::UnsequencedHeartbeat { .. }) => {}
            (SessionState::Established, SessionMessage::Terminate { code, reason, .. }) => {
                info!("session {:?}: peer terminated the session with {:?}", inner.session_id, code);
                if let Some(flow) = inner.outbound.clone() {
                    if let Err(e) = flow.send_end_of_stream() {
                        debug!("session {:?}: confirming Terminate failed: {}", inner.session_id, e);
                    }
                }
                self.terminate_locked(&mut inner, code, reason.as_deref(), false);
            }
            (SessionState::Finalizing, SessionMessage::Terminate { code, reason, .. }) => {
                self.terminate_locked(&mut inner, code, reason.as_deref(), false);
            }
            (SessionState::Negotiating | SessionState::Establishing, SessionMessage::Terminate { code, reason, .. }) => {
                self.terminate_locked(&mut inner, code, reason.as_deref(), false);
            }
            (state, message) => {
                self.protocol_violation(&mut inner, &format!("unexpected {:?} in state {:?}", message.template_id(), state));
            }
        }
    }

    fn on_negotiate(&self, inner: &mut SessionInner, session_id: Uuid, timestamp: u64, client_flow: FlowType, credentials: Bytes) {
        debug!("session {}: client negotiates with flow {:?}", session_id, client_flow);
        inner.session_id = Some(session_id);
        inner.inbound_flow = Some(client_flow);
        inner.receiver = ReceiveSequencer::new(client_flow);
        inner.negotiate_timestamp = timestamp;
        self.set_state(inner, SessionState::Negotiating);

        let Some(authenticator) = self.engine.authenticator().cloned() else {
            warn!("session {}: no authenticator is configured, rejecting", session_id);
            self.reject_negotiation(inner, session_id, "no authenticator");
            return;
        };

        let session = self.myself.clone();
        tokio::spawn(async move {
            let accepted = authenticator.validate(session_id, &credentials).await;
            if let Some(session) = session.upgrade() {
                session.on_validated(session_id, accepted);
            }
        });
    }

    fn on_validated(&self, session_id: Uuid, accepted: bool) {
        let mut inner = self.lock();
        if inner.state != SessionState::Negotiating {
            debug!("session {}: credential validation completed in state {:?}, ignoring", session_id, inner.state);
            return;
        }
        if !accepted {
            self.reject_negotiation(&mut inner, session_id, "invalid credentials");
            return;
        }

        if let Err(e) = self.register(&mut inner, session_id) {
            warn!("session {}: {}", session_id, e);
            let reject = SessionMessage::NegotiationReject {
                session_id,
                request_timestamp: inner.negotiate_timestamp,
                code: TerminationCode::Unspecified,
                reason: Some("duplicate session id".to_string()),
            };
            if let Err(e) = self.write_control(&reject) {
                debug!("session {}: NegotiationReject could not be sent: {}", session_id, e);
            }
            self.terminate_locked(&mut inner, TerminationCode::Unspecified, Some("duplicate session id"), false);
            return;
        }

        let response = SessionMessage::NegotiationResponse {
            session_id,
            request_timestamp: inner.negotiate_timestamp,
            server_flow: self.config.outbound_flow,
        };
        match self.write_control(&response) {
            Ok(()) => self.set_state(&mut inner, SessionState::Establishing),
            Err(e) => {
                warn!("session {}: sending NegotiationResponse failed: {}", session_id, e);
                self.terminate_locked(&mut inner, TerminationCode::TransportFailure, None, false);
            }
        }
    }

    fn reject_negotiation(&self, inner: &mut SessionInner, session_id: Uuid, reason: &str) {
        let reject = SessionMessage::NegotiationReject {
            session_id,
            request_timestamp: inner.negotiate_timestamp,
            code: TerminationCode::Unauthorized,
            reason: Some(reason.to_string()),
        };
        if let Err(e) = self.write_control(&reject) {
            debug!("session {}: NegotiationReject could not be sent: {}", session_id, e);
        }
        self.terminate_locked(inner, TerminationCode::Unauthorized, Some(reason), false);
    }

    fn on_negotiation_response(&self, inner: &mut SessionInner, request_timestamp: u64, server_flow: FlowType) {
        if request_timestamp != inner.negotiate_timestamp {
            self.protocol_violation(inner, "NegotiationResponse does not match the Negotiate");
            return;
        }
        let Some(session_id) = inner.session_id else {
            return;
        };

        inner.inbound_flow = Some(server_flow);
        inner.receiver = ReceiveSequencer::new(server_flow);

        let timestamp = timestamp_nanos();
        inner.establish_timestamp = timestamp;
        let establish = SessionMessage::Establish {
            session_id,
            timestamp,
            keepalive_millis: self.config.keepalive_millis(),
            next_seq_no: FIRST_SEQ_NO,
        };
        match self.write_control(&establish) {
            Ok(()) => self.set_state(inner, SessionState::Establishing),
            Err(e) => {
                warn!("session {}: sending Establish failed: {}", session_id, e);
                self.terminate_locked(inner, TerminationCode::TransportFailure, None, false);
            }
        }
    }

    fn on_establish(&self, inner: &mut SessionInner, timestamp: u64, keepalive_millis: u32, next_seq_no: u64) {
        let Some(session_id) = inner.session_id else {
            return;
        };

        if keepalive_millis == 0 {
            let reject = SessionMessage::EstablishmentReject {
                session_id,
                request_timestamp: timestamp,
                code: TerminationCode::Unspecified,
                reason: Some("keepalive interval must be positive".to_string()),
            };
            if let Err(e) = self.write_control(&reject) {
                debug!("session {}: EstablishmentReject could not be sent: {}", session_id, e);
            }
            self.terminate_locked(inner, TerminationCode::Unspecified, Some("invalid keepalive interval"), false);
            return;
        }
        trace!("session {}: client starts sending at #{}", session_id, next_seq_no);

        let ack = SessionMessage::EstablishmentAck {
            session_id,
            request_timestamp: timestamp,
            keepalive_millis: self.config.keepalive_millis(),
            next_seq_no: FIRST_SEQ_NO,
        };
        if let Err(e) = self.write_control(&ack) {
            warn!("session {}: sending EstablishmentAck failed: {}", session_id, e);
            self.terminate_locked(inner, TerminationCode::TransportFailure, None, false);
            return;
        }
        self.become_established(inner, session_id, Duration::from_millis(keepalive_millis.into()));
    }

    fn on_establishment_ack(&self, inner: &mut SessionInner, request_timestamp: u64, keepalive_millis: u32) {
        if request_timestamp != inner.establish_timestamp {
            self.protocol_violation(inner, "EstablishmentAck does not match the Establish");
            return;
        }
        if keepalive_millis == 0 {
            self.protocol_violation(inner, "server announced a keepalive interval of 0");
            return;
        }
        let Some(session_id) = inner.session_id else {
            return;
        };
        self.become_established(inner, session_id, Duration::from_millis(keepalive_millis.into()));
    }

    fn become_established(&self, inner: &mut SessionInner, session_id: Uuid, peer_keepalive: Duration) {
        let ctx = FlowContext {
            session_id,
            reactor: self.engine.reactor().clone(),
            transport: self.transport.clone(),
            keepalive_interval: self.config.keepalive_interval,
            max_write_retries: self.config.max_write_retries,
        };
        inner.outbound = Some(create_flow_sender(self.config.outbound_flow, ctx, self.engine.store().clone()));

        self.start_peer_monitor(inner, session_id, peer_keepalive);
        self.set_state(inner, SessionState::Established);
        self.engine.reactor().post(
            Topic::session(session_id, SessionEventKind::Ready),
            Event::SessionReady { session_id },
        );
        info!("session {}: established, sending {:?}, receiving {:?}", session_id, self.config.outbound_flow, inner.inbound_flow);
    }

    fn start_peer_monitor(&self, inner: &mut SessionInner, session_id: Uuid, peer_keepalive: Duration) {
        let topic = Topic::session(session_id, SessionEventKind::PeerHeartbeat);
        let session = self.myself.clone();
        let subscription = self.engine.reactor().subscribe(topic.clone(), move |_: &Topic, _: &Event| -> anyhow::Result<()> {
            if let Some(session) = session.upgrade() {
                session.on_peer_tick();
            }
            Ok(())
        });
        let timer = self.engine.reactor().post_at_interval(topic, Event::Tick, peer_keepalive);

        inner.received_since_tick = false;
        inner.missed_ticks = 0;
        inner.peer_monitor = Some(PeerMonitor { timer, subscription });
    }

    fn on_peer_tick(&self) {
        let mut inner = self.lock();
        if !matches!(inner.state, SessionState::Established | SessionState::Finalizing) {
            return;
        }

        if inner.received_since_tick {
            inner.received_since_tick = false;
            inner.missed_ticks = 0;
            return;
        }

        inner.missed_ticks += 1;
        trace!("session {:?}: nothing received from the peer for {} keepalive intervals", inner.session_id, inner.missed_ticks);
        if inner.missed_ticks >= self.config.peer_keepalive_tolerance {
            warn!("session {:?}: peer missed {} keepalive intervals", inner.session_id, inner.missed_ticks);
            self.terminate_locked(&mut inner, TerminationCode::KeepaliveTimeout, Some("peer keepalive timeout"), true);
        }
    }

    fn on_sequence(&self, inner: &mut SessionInner, next_seq_no: u64) {
        let Some(gap) = inner.receiver.on_sequence(next_seq_no) else {
            return;
        };
        let Some(session_id) = inner.session_id else {
            return;
        };

        let mut buf = BytesMut::with_capacity(64);
        match inner.receiver.flow_type() {
            FlowType::Recoverable => {
                debug!("session {}: requesting retransmission of {} messages from #{}", session_id, gap.count, gap.from_seq_no);
                let timestamp = timestamp_nanos();
                for (from_seq_no, count) in retransmit_chunks(gap, self.config.max_retransmit_count) {
                    SessionMessage::RetransmitRequest { session_id, timestamp, from_seq_no, count }
                        .ser_framed(&mut buf);
                }
            }
            _ => {
                debug!("session {}: {} messages from #{} were lost", session_id, gap.count, gap.from_seq_no);
                SessionMessage::NotApplied {
                    session_id,
                    from_seq_no: gap.from_seq_no,
                    count: gap.count,
                }.ser_framed(&mut buf);
            }
        }
        if let Err(e) = write_with_retry(self.transport.as_ref(), &buf, self.config.max_write_retries) {
            warn!("session {}: reporting a gap failed: {}", session_id, e);
            self.terminate_locked(inner, TerminationCode::TransportFailure, None, false);
        }
    }

    fn on_retransmit_request(&self, inner: &mut SessionInner, timestamp: u64, from_seq_no: u64, count: u32) {
        let Some(session_id) = inner.session_id else {
            return;
        };
        let next_seq_no = inner.outbound.as_ref()
            .map(|flow| flow.next_seq_no())
            .unwrap_or(FIRST_SEQ_NO);

        let in_bounds = self.config.outbound_flow == FlowType::Recoverable
            && from_seq_no >= FIRST_SEQ_NO
            && count <= self.config.max_retransmit_count
            && from_seq_no.checked_add(count.into()).is_some_and(|end| end <= next_seq_no);
        if !in_bounds {
            warn!("session {}: retransmission of {} messages from #{} is out of bounds", session_id, count, from_seq_no);
            self.terminate_locked(inner, TerminationCode::ReRequestOutOfBounds, Some("retransmit request out of bounds"), true);
            return;
        }

        debug!("session {}: peer requests {} messages from #{}", session_id, count, from_seq_no);
        self.engine.reactor().post(
            Topic::service(ServiceEventKind::RetransmitRequestReceived),
            Event::RetransmitRequest(RetransmitRequestData { session_id, from_seq_no, count, timestamp }),
        );
    }

    fn on_application_message(&self, message: &[u8]) {
        let (session_id, seq_no) = {
            let mut inner = self.lock();
            let session_id = match (inner.state, inner.session_id, inner.inbound_flow) {
                (SessionState::Terminated, _, _) => return,
                (_, _, Some(FlowType::None)) => {
                    self.protocol_violation(&mut inner, "application message on a None flow");
                    return;
                }
                (SessionState::Established | SessionState::Finalizing, Some(session_id), _) => session_id,
                (state, _, _) => {
                    self.protocol_violation(&mut inner, &format!("application message in state {:?}", state));
                    return;
                }
            };
            match inner.receiver.on_application_message() {
                Some(seq_no) => (session_id, seq_no),
                None => {
                    trace!("session {}: dropping a duplicate message", session_id);
                    return;
                }
            }
        };

        self.consumer.accept(message, session_id, seq_no);
    }
}

impl TransportConsumer for Session {
    fn connected(&self) {
        trace!("session transport connected");
    }

    fn disconnected(&self) {
        let mut inner = self.lock();
        let code = match inner.state {
            SessionState::Terminated => return,
            SessionState::Finalizing => TerminationCode::Finished,
            _ => TerminationCode::TransportFailure,
        };
        debug!("session {:?}: transport disconnected in state {:?}", inner.session_id, inner.state);
        self.terminate_locked(&mut inner, code, None, false);
    }

    fn accept(&self, buf: &[u8]) {
        self.lock().received_since_tick = true;

        for body in FrameSplitter::new(buf) {
            let frame = body.and_then(decode_frame);
            match frame {
                Ok(Frame::Session(message)) => self.on_session_message(message),
                Ok(Frame::Application(message)) => self.on_application_message(message),
                Err(e) => {
                    let mut inner = self.lock();
                    if inner.state != SessionState::Terminated {
                        self.protocol_violation(&mut inner, &format!("malformed frame: {}", e));
                    }
                    return;
                }
            }
        }
    }
}

impl SessionHandle for Session {
    fn state(&self) -> SessionState {
        Session::state(self)
    }

    fn resend(&self, messages: &[Bytes], offset: usize, count: usize, from_seq_no: u64, request_timestamp: u64) -> Result<(), FixpError> {
        self.established_flow("resend")?
            .resend(messages, offset, count, from_seq_no, request_timestamp)
    }
}

/// Splits a gap into ranges of at most `max_count` messages, the largest request a peer accepts
fn retransmit_chunks(gap: Gap, max_count: u32) -> impl Iterator<Item = (u64, u32)> {
    let max_count = max_count.max(1);
    let end = gap.from_seq_no + u64::from(gap.count);
    (gap.from_seq_no..end)
        .step_by(max_count.safe_cast())
        .map(move |from_seq_no| {
            let count = (end - from_seq_no).min(u64::from(max_count));
            (from_seq_no, u32::try_from(count).unwrap_or(max_count))
        })
}
