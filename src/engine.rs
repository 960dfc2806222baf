use std::sync::Arc;

use tracing::info;

use crate::auth::Authenticator;
use crate::config::EngineConfig;
use crate::error::FixpError;
use crate::reactor::EventReactor;
use crate::retransmitter::Retransmitter;
use crate::session::Sessions;
use crate::store::in_memory::InMemoryMessageStore;
use crate::store::MessageStore;

/// The infrastructure that all sessions of a process share: the event reactor, the session
///  registry, the message store with its retransmitter, and (for servers) the authenticator.
pub struct Engine {
    reactor: Arc<EventReactor>,
    sessions: Arc<Sessions>,
    store: Arc<dyn MessageStore>,
    retransmitter: Retransmitter,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn MessageStore>, authenticator: Option<Arc<dyn Authenticator>>) -> Result<Arc<Engine>, FixpError> {
        config.validate().map_err(FixpError::Config)?;

        let reactor = Arc::new(EventReactor::new(Arc::new(config.reactor)));
        let sessions = Arc::new(Sessions::new());
        let retransmitter = Retransmitter::new(reactor.clone(), store.clone(), sessions.clone());
        Ok(Arc::new(Engine {
            reactor,
            sessions,
            store,
            retransmitter,
            authenticator,
        }))
    }

    /// An engine with an in-memory message store
    pub fn with_defaults(authenticator: Option<Arc<dyn Authenticator>>) -> Result<Arc<Engine>, FixpError> {
        Self::new(EngineConfig::default(), Arc::new(InMemoryMessageStore::new()), authenticator)
    }

    /// NB: must be called from within a tokio runtime
    pub async fn open(&self) -> Result<(), FixpError> {
        info!("opening engine {}", self.reactor.name());
        self.reactor.open()?;
        self.store.open().await?;
        self.retransmitter.open();
        Ok(())
    }

    pub async fn close(&self) {
        info!("closing engine {}", self.reactor.name());
        self.retransmitter.close();
        self.store.close().await;
        self.reactor.close();
    }

    pub fn reactor(&self) -> &Arc<EventReactor> {
        &self.reactor
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }
}
