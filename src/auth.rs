//! Credential validation for server sessions. The protocol does not define what credentials look
//!  like, it only carries them as opaque bytes in the Negotiate message.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use tracing::debug;
use uuid::Uuid;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Returns `true` if a client presenting `credentials` may open session `session_id`
    async fn validate(&self, session_id: Uuid, credentials: &[u8]) -> bool;
}

/// Accepts exactly the credentials that were added to it
#[derive(Default)]
pub struct DirectoryAuthenticator {
    credentials: RwLock<FxHashSet<Bytes>>,
}

impl DirectoryAuthenticator {
    pub fn new() -> DirectoryAuthenticator {
        DirectoryAuthenticator::default()
    }

    pub fn add(&self, credentials: impl Into<Bytes>) {
        self.credentials.write().unwrap_or_else(PoisonError::into_inner)
            .insert(credentials.into());
    }

    pub fn remove(&self, credentials: &[u8]) -> bool {
        self.credentials.write().unwrap_or_else(PoisonError::into_inner)
            .remove(credentials)
    }
}

#[async_trait]
impl Authenticator for DirectoryAuthenticator {
    async fn validate(&self, session_id: Uuid, credentials: &[u8]) -> bool {
        let known = self.credentials.read().unwrap_or_else(PoisonError::into_inner)
            .contains(credentials);
        if !known {
            debug!("session {}: unknown credentials", session_id);
        }
        known
    }
}
