use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::FixpError;
use crate::session::SessionHandle;
use crate::util::atomic_map::AtomicMap;

/// The registry of live sessions by id. Lookups work on a snapshot and never block registration.
#[derive(Default)]
pub struct Sessions {
    sessions: AtomicMap<Uuid, Arc<dyn SessionHandle>>,
}

impl Sessions {
    pub fn new() -> Sessions {
        Sessions::default()
    }

    /// Fails if a session with the same id is registered already
    pub fn add_session(&self, session_id: Uuid, session: Arc<dyn SessionHandle>) -> Result<(), FixpError> {
        self.sessions.update(|sessions| {
            if sessions.contains_key(&session_id) {
                return Err(FixpError::Protocol(format!("session {} exists already", session_id)));
            }
            debug!("registering session {}", session_id);
            sessions.insert(session_id, session);
            Ok(())
        })
    }

    pub fn remove_session(&self, session_id: &Uuid) -> Option<Arc<dyn SessionHandle>> {
        let removed = self.sessions.update(|sessions| sessions.remove(session_id));
        if removed.is_some() {
            debug!("unregistered session {}", session_id);
        }
        removed
    }

    pub fn get_session(&self, session_id: &Uuid) -> Option<Arc<dyn SessionHandle>> {
        self.sessions.get(session_id)
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.load()
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.load().is_empty()
    }
}
