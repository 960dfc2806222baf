//! The log of sent application messages that a Recoverable flow serves retransmissions from.
//!
//! Entries are keyed by session id and sequence number. They are appended in strictly increasing
//!  sequence order per session and never overwritten. Retention is up to the implementation.

pub mod in_memory;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use uuid::Uuid;

use crate::error::StoreError;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn open(&self) -> Result<(), StoreError>;

    async fn close(&self);

    /// Called on the send path, so implementations must not block. Sequence numbers for a
    ///  session must be strictly increasing.
    fn insert_message(&self, session_id: Uuid, seq_no: u64, message: Bytes) -> Result<(), StoreError>;

    /// Returns exactly `count` messages starting at `from_seq_no`, or an error if any of them is
    ///  missing. A short result is never returned.
    fn retrieve_messages(&self, session_id: Uuid, from_seq_no: u64, count: u32) -> Result<Vec<Bytes>, StoreError>;
}
