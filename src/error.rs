use thiserror::Error;
use uuid::Uuid;

use crate::messages::TerminationCode;
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store is not open")]
    NotOpen,
    #[error("no messages are stored for session {0}")]
    UnknownSession(Uuid),
    #[error("message {seq_no} is missing for session {session_id}")]
    MissingEntry {
        session_id: Uuid,
        seq_no: u64,
    },
    #[error("message {seq_no} for session {session_id} does not follow the last stored message {last_seq_no}")]
    OutOfOrder {
        session_id: Uuid,
        seq_no: u64,
        last_seq_no: u64,
    },
}

#[derive(Debug, Error)]
pub enum FixpError {
    /// A malformed or unexpected frame, or an operation the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("credentials for session {0} were rejected")]
    Authentication(Uuid),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{operation} is not possible in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("session terminated with {0:?}")]
    Terminated(TerminationCode),
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("{0} is closed")]
    Closed(&'static str),
}
