use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::MessageStore;
use crate::util::atomic_map::AtomicMap;

type SessionLog = Arc<Mutex<BTreeMap<u64, Bytes>>>;

/// Keeps all messages in memory until the store is closed. Each session's log has its own lock,
///  so sessions do not contend with each other.
#[derive(Default)]
pub struct InMemoryMessageStore {
    is_open: AtomicBool,
    sessions: AtomicMap<Uuid, SessionLog>,
}

impl InMemoryMessageStore {
    pub fn new() -> InMemoryMessageStore {
        InMemoryMessageStore::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_open.load(Ordering::Acquire) {
            Ok(())
        }
        else {
            Err(StoreError::NotOpen)
        }
    }

    fn session_log(&self, session_id: Uuid) -> SessionLog {
        if let Some(log) = self.sessions.get(&session_id) {
            return log;
        }
        self.sessions.update(|sessions| {
            sessions.entry(session_id)
                .or_default()
                .clone()
        })
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn open(&self) -> Result<(), StoreError> {
        debug!("opening in-memory message store");
        self.is_open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        debug!("closing in-memory message store");
        self.is_open.store(false, Ordering::Release);
        self.sessions.update(|sessions| sessions.clear());
    }

    fn insert_message(&self, session_id: Uuid, seq_no: u64, message: Bytes) -> Result<(), StoreError> {
        self.check_open()?;

        let log = self.session_log(session_id);
        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((&last_seq_no, _)) = log.last_key_value() {
            if seq_no <= last_seq_no {
                return Err(StoreError::OutOfOrder { session_id, seq_no, last_seq_no });
            }
        }
        trace!("session {}: storing message #{}", session_id, seq_no);
        log.insert(seq_no, message);
        Ok(())
    }

    fn retrieve_messages(&self, session_id: Uuid, from_seq_no: u64, count: u32) -> Result<Vec<Bytes>, StoreError> {
        self.check_open()?;

        let log = self.sessions.get(&session_id)
            .ok_or(StoreError::UnknownSession(session_id))?;
        let log = log.lock().unwrap_or_else(PoisonError::into_inner);

        let mut result = Vec::with_capacity(count as usize);
        for offset in 0..u64::from(count) {
            let seq_no = from_seq_no.checked_add(offset)
                .ok_or(StoreError::MissingEntry { session_id, seq_no: u64::MAX })?;
            match log.get(&seq_no) {
                Some(message) => result.push(message.clone()),
                None => return Err(StoreError::MissingEntry { session_id, seq_no }),
            }
        }
        Ok(result)
    }
}
