//! Wire representation of FIXP session messages.
//!
//! Every frame starts with a Simple Open Framing Header ([frame::FrameHeader]), followed by an
//!  SBE message header ([header::MessageHeader]) and the message body. Frames whose schema id is
//!  [SESSION_SCHEMA_ID] are session-layer control messages ([SessionMessage]); all other frames
//!  are application messages and are passed to the application unchanged (including their
//!  message header).
//!
//! ```ascii
//! 0: frame length (u32 BE)
//! 4: encoding type 0x5BE0 (u16 BE)
//! 6: block length (u16 LE)
//! 8: template id (u16 LE)
//! 10: schema id (u16 LE)
//! 12: schema version (u16 LE)
//! 14: body: session id (16 bytes) and template specific fields for session messages
//! ```

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod frame;
pub mod header;
pub mod session_messages;

pub use frame::{put_frame, FrameHeader, FrameSplitter};
pub use header::MessageHeader;
pub use session_messages::{decode_frame, peek_session_message, Frame, SessionMessage, TemplateId};

pub const SESSION_SCHEMA_ID: u16 = 1;
pub const SESSION_SCHEMA_VERSION: u16 = 0;

/// The sequencing and recovery policy for one direction of a session
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FlowType {
    /// Implicitly sequenced, gaps are reported but not recovered
    Idempotent = 0,
    /// Sequenced, every message is stored for retransmission
    Recoverable = 1,
    /// No sequence numbers, no recovery
    Unsequenced = 2,
    /// No application messages flow in this direction
    None = 3,
}

impl FlowType {
    pub fn is_sequenced(&self) -> bool {
        matches!(self, FlowType::Idempotent | FlowType::Recoverable)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TerminationCode {
    Finished = 0,
    Unspecified = 1,
    ReRequestOutOfBounds = 2,
    ReRequestInProgress = 3,
    Unauthorized = 4,
    Malformed = 5,
    KeepaliveTimeout = 6,
    TransportFailure = 7,
}
