//! Outbound flows: the policies for sequencing, storing and heartbeating the messages a session
//!  sends.
//!
//! All flow types share the write path: framing and the transport write happen inside a
//!  [critical_section::CriticalSection], so that writes are totally ordered and sequence numbers
//!  advance together with the write. A failed write ends the flow: it attempts a Terminate frame
//!  (whose own failure is ignored), stops heartbeats and posts a 'suspended' event for the session.
//!  After that, sends and resends are rejected.

pub mod critical_section;
pub mod idempotent;
pub mod recoverable;
pub mod unsequenced;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::FixpError;
use crate::flow::critical_section::CriticalSection;
use crate::messages::{FlowType, FrameHeader, SessionMessage, TerminationCode};
use crate::reactor::{Event, EventReactor, SessionEventKind, Subscription, TimerSchedule, Topic};
use crate::store::MessageStore;
use crate::transport::{write_with_retry, Transport};

pub use idempotent::IdempotentFlowSender;
pub use recoverable::RecoverableFlowSender;
pub use unsequenced::UnsequencedFlowSender;

pub trait FlowSender: Send + Sync + 'static {
    fn flow_type(&self) -> FlowType;

    /// Returns the sequence number assigned to the message, or 0 for unsequenced flows
    fn send(&self, message: &[u8]) -> Result<u64, FixpError> {
        self.send_batch(&[message])
    }

    /// Sends all messages in a single transport write. Returns the sequence number of the last
    ///  message, or 0 for unsequenced flows.
    fn send_batch(&self, messages: &[&[u8]]) -> Result<u64, FixpError>;

    /// Called on every keepalive tick, sends a heartbeat if nothing was sent since the
    ///  previous tick
    fn send_heartbeat(&self) -> Result<(), FixpError>;

    /// Stops heartbeats and writes a Terminate frame with code `Finished`
    fn send_end_of_stream(&self) -> Result<(), FixpError>;

    fn next_seq_no(&self) -> u64;

    /// Writes `messages[offset..offset+count]` as a retransmission of the messages starting at
    ///  `from_seq_no`, in response to a request with timestamp `request_timestamp`
    fn resend(&self, _messages: &[Bytes], _offset: usize, _count: usize, _from_seq_no: u64, _request_timestamp: u64) -> Result<(), FixpError> {
        Err(FixpError::Protocol(format!("{:?} flows do not support retransmission", self.flow_type())))
    }

    /// Stops heartbeats without writing anything
    fn shutdown(&self);
}

#[derive(Clone)]
pub struct FlowContext {
    pub session_id: Uuid,
    pub reactor: Arc<EventReactor>,
    pub transport: Arc<dyn Transport>,
    pub keepalive_interval: Duration,
    pub max_write_retries: u32,
}

/// Creates the sender for `flow_type` and starts its heartbeat timer
pub fn create_flow_sender(flow_type: FlowType, ctx: FlowContext, store: Arc<dyn MessageStore>) -> Arc<dyn FlowSender> {
    match flow_type {
        FlowType::Idempotent => IdempotentFlowSender::new(ctx),
        FlowType::Recoverable => RecoverableFlowSender::new(ctx, store),
        FlowType::Unsequenced | FlowType::None => UnsequencedFlowSender::new(ctx, flow_type),
    }
}

/// The parts that all flow types share
pub(crate) struct FlowCore {
    ctx: FlowContext,
    critical_section: CriticalSection,
    heartbeat_due: AtomicBool,
    heartbeat: Mutex<Option<(TimerSchedule, Subscription)>>,
    /// set when heartbeats are stopped; ticks that were queued before are ignored
    stopped: AtomicBool,
    failed: AtomicBool,
}

impl FlowCore {
    fn new(ctx: FlowContext) -> FlowCore {
        FlowCore {
            ctx,
            critical_section: CriticalSection::new(),
            heartbeat_due: AtomicBool::new(true),
            heartbeat: Mutex::new(None),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn session_id(&self) -> Uuid {
        self.ctx.session_id
    }

    fn start_heartbeat(&self, sender: Weak<dyn FlowSender>) {
        let topic = Topic::session(self.ctx.session_id, SessionEventKind::Heartbeat);

        let session_id = self.ctx.session_id;
        let subscription = self.ctx.reactor.subscribe(topic.clone(), move |_: &Topic, _: &Event| -> anyhow::Result<()> {
            if let Some(sender) = sender.upgrade() {
                if let Err(e) = sender.send_heartbeat() {
                    debug!("session {}: heartbeat failed: {}", session_id, e);
                }
            }
            Ok(())
        });
        let timer = self.ctx.reactor.post_at_interval(topic, Event::Tick, self.ctx.keepalive_interval);

        let previous = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
            .replace((timer, subscription));
        if let Some((timer, subscription)) = previous {
            timer.cancel();
            subscription.unsubscribe();
        }
    }

    fn stop_heartbeat(&self) {
        self.stopped.store(true, Ordering::Release);
        let heartbeat = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((timer, subscription)) = heartbeat {
            trace!("session {}: stopping heartbeat", self.ctx.session_id);
            timer.cancel();
            subscription.unsubscribe();
        }
    }

    fn mark_sent(&self) {
        self.heartbeat_due.store(false, Ordering::Release);
    }

    /// Returns `true` if nothing was sent since the previous call and heartbeats were not stopped
    fn take_heartbeat_due(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.heartbeat_due.swap(true, Ordering::AcqRel)
    }

    /// Must be called inside the critical section
    fn check_not_failed(&self) -> Result<(), FixpError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(FixpError::Closed("outbound flow"));
        }
        Ok(())
    }

    /// Writes `buf`, ending the flow if that fails. Must be called inside the critical section.
    fn write(&self, buf: &[u8]) -> Result<(), FixpError> {
        match write_with_retry(self.ctx.transport.as_ref(), buf, self.ctx.max_write_retries) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Must be called inside the critical section
    fn fail(&self, e: &FixpError) {
        self.failed.store(true, Ordering::Release);
        warn!("session {}: outbound flow failed: {} - suspending the session", self.ctx.session_id, e);
        self.stop_heartbeat();
        if let Err(e) = self.write_terminate() {
            debug!("session {}: Terminate after a failure failed as well: {}", self.ctx.session_id, e);
        }
        self.ctx.reactor.post(
            Topic::session(self.ctx.session_id, SessionEventKind::Suspended),
            Event::SessionSuspended { session_id: self.ctx.session_id, reason: e.to_string() },
        );
    }

    /// Must be called inside the critical section
    fn write_terminate(&self) -> Result<(), FixpError> {
        let mut buf = BytesMut::new();
        SessionMessage::Terminate {
            session_id: self.ctx.session_id,
            code: TerminationCode::Finished,
            reason: None,
        }.ser_framed(&mut buf);
        write_with_retry(self.ctx.transport.as_ref(), &buf, self.ctx.max_write_retries)?;
        Ok(())
    }

    fn send_end_of_stream(&self) -> Result<(), FixpError> {
        debug!("session {}: end of stream", self.ctx.session_id);
        self.stop_heartbeat();
        let _guard = self.critical_section.enter();
        self.write_terminate()
    }
}

fn check_message_lengths(messages: &[&[u8]]) -> Result<(), FixpError> {
    match messages.iter().find(|m| m.len() > FrameHeader::MAX_BODY_LEN) {
        Some(m) => Err(FixpError::Protocol(format!("a message of {} bytes does not fit into a frame", m.len()))),
        None => Ok(()),
    }
}

fn batch_capacity(messages: &[&[u8]]) -> usize {
    const SEQUENCE_FRAME_LEN: usize = 64;
    SEQUENCE_FRAME_LEN + messages.iter()
        .map(|m| m.len() + FrameHeader::SERIALIZED_LEN)
        .sum::<usize>()
}
