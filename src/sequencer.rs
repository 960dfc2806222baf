//! Sequence numbering for both directions of a session.
//!
//! Sequenced flows do not put a sequence number on application messages. The sender emits a
//!  `Sequence` frame at the start of the stream and with every heartbeat, and the receiver
//!  derives each message's number by counting frames since the last `Sequence` frame. A gap shows
//!  when a `Sequence` frame announces a number higher than the receiver counted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::messages::{put_frame, FlowType, SessionMessage};
use crate::util::safe_converter::SafeCast;

pub const FIRST_SEQ_NO: u64 = 1;

/// The result of framing a batch, to be [committed](Sequencer::commit) once it was written
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SequencedBatch {
    /// the number of the batch's last message, or of the last message sent before an empty batch
    pub last_seq_no: u64,
    pub next_seq_no: u64,
    pub sequence_frame_written: bool,
}

/// Outbound sequence numbers. This is not synchronized by itself: [Sequencer::apply] and
///  [Sequencer::commit] must be called from inside the owning flow's critical section.
pub struct Sequencer {
    session_id: Uuid,
    next_seq_no: AtomicU64,
    sequence_due: AtomicBool,
}

impl Sequencer {
    pub fn new(session_id: Uuid) -> Sequencer {
        Sequencer {
            session_id,
            next_seq_no: AtomicU64::new(FIRST_SEQ_NO),
            sequence_due: AtomicBool::new(true),
        }
    }

    pub fn next_seq_no(&self) -> u64 {
        self.next_seq_no.load(Ordering::Acquire)
    }

    /// Frames `messages` into `buf`, preceded by a `Sequence` frame at the start of the stream
    ///  and for an empty batch (i.e. a heartbeat). Nothing changes until the batch is committed.
    pub fn apply(&self, messages: &[&[u8]], buf: &mut BytesMut) -> SequencedBatch {
        let next_seq_no = self.next_seq_no.load(Ordering::Relaxed);

        let sequence_frame_written = messages.is_empty() || self.sequence_due.load(Ordering::Relaxed);
        if sequence_frame_written {
            SessionMessage::Sequence { session_id: self.session_id, next_seq_no }
                .ser_framed(buf);
        }

        for message in messages {
            put_frame(buf, message);
        }

        let len: u64 = messages.len().safe_cast();
        SequencedBatch {
            last_seq_no: (next_seq_no + len).saturating_sub(1),
            next_seq_no: next_seq_no + len,
            sequence_frame_written,
        }
    }

    pub fn commit(&self, batch: &SequencedBatch) {
        if batch.sequence_frame_written {
            self.sequence_due.store(false, Ordering::Relaxed);
        }
        self.next_seq_no.store(batch.next_seq_no, Ordering::Release);
    }

    /// Writes a `Sequence` frame for the current position without changing it
    pub fn sequence_frame(&self, buf: &mut BytesMut) {
        SessionMessage::Sequence { session_id: self.session_id, next_seq_no: self.next_seq_no() }
            .ser_framed(buf);
    }

    /// Jumps to `next_seq_no`, announcing the jump with the next batch. This exists for
    ///  simulating gaps in tests.
    pub fn set_next_seq_no(&self, next_seq_no: u64) {
        debug!("session {}: moving next sequence number to {}", self.session_id, next_seq_no);
        self.next_seq_no.store(next_seq_no, Ordering::Release);
        self.sequence_due.store(true, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Gap {
    pub from_seq_no: u64,
    pub count: u32,
}

#[derive(Clone, Copy, Debug)]
struct RetransmissionWindow {
    next_seq_no: u64,
    remaining: u32,
}

/// Inbound sequence bookkeeping for one session
pub struct ReceiveSequencer {
    flow_type: FlowType,
    expected_seq_no: u64,
    highest_delivered: u64,
    retransmission: Option<RetransmissionWindow>,
}

impl ReceiveSequencer {
    pub fn new(flow_type: FlowType) -> ReceiveSequencer {
        ReceiveSequencer {
            flow_type,
            expected_seq_no: FIRST_SEQ_NO,
            highest_delivered: 0,
            retransmission: None,
        }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow_type
    }

    pub fn expected_seq_no(&self) -> u64 {
        self.expected_seq_no
    }

    /// Handles the peer's `Sequence` frame, returning the gap it reveals if any
    pub fn on_sequence(&mut self, next_seq_no: u64) -> Option<Gap> {
        if !self.flow_type.is_sequenced() {
            return None;
        }

        let result = if next_seq_no > self.expected_seq_no {
            let missing = next_seq_no - self.expected_seq_no;
            Some(Gap {
                from_seq_no: self.expected_seq_no,
                count: missing.try_into().unwrap_or(u32::MAX),
            })
        }
        else {
            if next_seq_no < self.expected_seq_no {
                debug!("peer moved back from {} to {}, messages up to {} will be dropped as duplicates", self.expected_seq_no, next_seq_no, self.highest_delivered);
            }
            None
        };

        self.expected_seq_no = next_seq_no;
        result
    }

    /// The next `count` application messages are retransmissions starting at `next_seq_no`
    pub fn on_retransmission(&mut self, next_seq_no: u64, count: u32) {
        if !self.flow_type.is_sequenced() || count == 0 {
            return;
        }
        self.retransmission = Some(RetransmissionWindow {
            next_seq_no,
            remaining: count,
        });
    }

    /// Assigns the sequence number for an inbound application message, or returns `None` if the
    ///  message is a duplicate that must not be delivered. Unsequenced messages get number 0.
    pub fn on_application_message(&mut self) -> Option<u64> {
        if !self.flow_type.is_sequenced() {
            return Some(0);
        }

        if let Some(window) = &mut self.retransmission {
            let seq_no = window.next_seq_no;
            window.next_seq_no += 1;
            window.remaining -= 1;
            if window.remaining == 0 {
                self.retransmission = None;
            }
            trace!("retransmitted message {}", seq_no);
            return Some(seq_no);
        }

        let seq_no = self.expected_seq_no;
        self.expected_seq_no += 1;
        if seq_no <= self.highest_delivered {
            return None;
        }
        self.highest_delivered = seq_no;
        Some(seq_no)
    }
}
