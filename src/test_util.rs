//! Helpers for unit tests: a transport that records what is written to it, and builders for
//!  application messages.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::FixpError;
use crate::messages::{decode_frame, Frame, FrameSplitter, MessageHeader, SessionMessage, TemplateId};
use crate::transport::{Transport, TransportConsumer};

pub const APPLICATION_SCHEMA_ID: u16 = 33;

/// An application message (message header + payload) as it would be passed to `send()`
pub fn app_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    MessageHeader { block_length: payload.len() as u16, template_id: 1, schema_id: APPLICATION_SCHEMA_ID, version: 0 }.ser(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedFrame {
    Session(SessionMessage),
    Application(Bytes),
}

impl RecordedFrame {
    pub fn template_id(&self) -> Option<TemplateId> {
        match self {
            RecordedFrame::Session(msg) => Some(msg.template_id()),
            RecordedFrame::Application(_) => None,
        }
    }
}

pub fn decode_frames(buf: &[u8]) -> Vec<RecordedFrame> {
    FrameSplitter::new(buf)
        .map(|body| match decode_frame(body.unwrap()).unwrap() {
            Frame::Session(msg) => RecordedFrame::Session(msg),
            Frame::Application(body) => RecordedFrame::Application(Bytes::copy_from_slice(body)),
        })
        .collect()
}

#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<Bytes>>,
    failing_writes: AtomicU32,
    backpressured_writes: AtomicU32,
    consumer: Mutex<Option<Arc<dyn TransportConsumer>>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport::default())
    }

    /// the next `n` writes fail
    pub fn fail_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// the next `n` writes return 0
    pub fn backpressure_writes(&self, n: u32) {
        self.backpressured_writes.store(n, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.writes().iter()
            .flat_map(|w| decode_frames(w))
            .collect()
    }

    pub fn session_messages(&self) -> Vec<SessionMessage> {
        self.frames().into_iter()
            .filter_map(|f| match f {
                RecordedFrame::Session(msg) => Some(msg),
                RecordedFrame::Application(_) => None,
            })
            .collect()
    }

    pub fn count(&self, template_id: TemplateId) -> usize {
        self.frames().iter()
            .filter(|f| f.template_id() == Some(template_id))
            .count()
    }

    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn consumer(&self) -> Option<Arc<dyn TransportConsumer>> {
        self.consumer.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open(&self, consumer: Arc<dyn TransportConsumer>) -> Result<(), FixpError> {
        consumer.connected();
        *self.consumer.lock().unwrap() = Some(consumer);
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if Self::take_one(&self.failing_writes) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        if Self::take_one(&self.backpressured_writes) {
            return Ok(0);
        }
        self.writes.lock().unwrap().push(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}
