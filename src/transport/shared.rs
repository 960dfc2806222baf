//! Several sessions over a single underlying transport.
//!
//! Inbound frames are routed by session id. Session control frames carry the id explicitly,
//!  application frames do not: they belong to the session that was identified last (the
//!  'context'). Correspondingly, a session that writes application frames after another session
//!  wrote first prefixes its write with an `UnsequencedHeartbeat` frame to switch the context.
//!
//! A Negotiate frame for an unknown session id is handed to the new-session factory, which is
//!  how servers accept sessions. Routing assumes that there is at most one negotiation in flight
//!  per shared transport.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::FixpError;
use crate::messages::{peek_session_message, FrameHeader, FrameSplitter, SessionMessage, TemplateId};
use crate::transport::{Transport, TransportConsumer};
use crate::util::atomic_map::AtomicMap;

/// Creates the consumer for a session that a peer starts negotiating. Returning `None` refuses
///  the session.
pub type NewSessionFactory = Box<dyn Fn(Uuid, Arc<SharedTransportHandle>) -> Option<Arc<dyn TransportConsumer>> + Send + Sync>;

pub struct SharedTransport {
    underlying: Arc<dyn Transport>,
    routes: AtomicMap<Uuid, Arc<dyn TransportConsumer>>,
    inbound_context: Mutex<Option<Uuid>>,
    outbound_context: Mutex<Option<Uuid>>,
    underlying_open: tokio::sync::Mutex<bool>,
    new_session_factory: RwLock<Option<NewSessionFactory>>,
    myself: Weak<SharedTransport>,
}

impl SharedTransport {
    pub fn new(underlying: Arc<dyn Transport>) -> Arc<SharedTransport> {
        Arc::new_cyclic(|myself| SharedTransport {
            underlying,
            routes: AtomicMap::new(),
            inbound_context: Mutex::new(None),
            outbound_context: Mutex::new(None),
            underlying_open: tokio::sync::Mutex::new(false),
            new_session_factory: RwLock::new(None),
            myself: myself.clone(),
        })
    }

    /// The transport for one session on this shared transport
    pub fn handle(self: &Arc<Self>, session_id: Uuid) -> Arc<SharedTransportHandle> {
        Arc::new(SharedTransportHandle {
            shared: self.clone(),
            session_id,
        })
    }

    pub fn set_new_session_factory(&self, factory: NewSessionFactory) {
        *self.new_session_factory.write().unwrap_or_else(PoisonError::into_inner) = Some(factory);
    }

    pub fn num_routes(&self) -> usize {
        self.routes.load().len()
    }

    /// Opens the underlying transport before any session is registered. Servers do this to
    ///  accept sessions through the new-session factory.
    pub async fn listen(&self) -> Result<(), FixpError> {
        self.ensure_open().await
    }

    async fn ensure_open(&self) -> Result<(), FixpError> {
        let mut is_open = self.underlying_open.lock().await;
        if !*is_open {
            let router = Arc::new(Router { shared: self.myself.clone() });
            self.underlying.open(router).await?;
            *is_open = true;
        }
        Ok(())
    }

    fn write_for(&self, session_id: Uuid, bufs: &[Bytes]) -> io::Result<usize> {
        let mut context = self.outbound_context.lock().unwrap_or_else(PoisonError::into_inner);

        let written = if *context != Some(session_id) && !starts_with_session_frame(bufs) {
            trace!("switching outbound context to session {}", session_id);
            let mut context_frame = BytesMut::new();
            SessionMessage::UnsequencedHeartbeat { session_id }.ser_framed(&mut context_frame);

            let mut with_context = Vec::with_capacity(bufs.len() + 1);
            with_context.push(context_frame.freeze());
            with_context.extend_from_slice(bufs);
            self.underlying.write_batch(&with_context)?
        }
        else {
            self.underlying.write_batch(bufs)?
        };

        if written > 0 {
            *context = Some(session_id);
        }
        Ok(written)
    }

    fn route(&self, frame: &[u8], body: &[u8]) {
        let session_id = {
            let mut context = self.inbound_context.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((template_id, session_id)) = peek_session_message(body) {
                *context = Some(session_id);
                if template_id == TemplateId::Negotiate && !self.routes.contains_key(&session_id) {
                    self.create_session(session_id);
                }
            }
            *context
        };

        let Some(session_id) = session_id else {
            warn!("application frame before any session was identified - dropping");
            return;
        };

        match self.routes.get(&session_id) {
            Some(consumer) => consumer.accept(frame),
            None => debug!("no session {} on this transport - dropping frame", session_id),
        }
    }

    fn create_session(&self, session_id: Uuid) {
        let Some(myself) = self.myself.upgrade() else {
            return;
        };

        let factory = self.new_session_factory.read().unwrap_or_else(PoisonError::into_inner);
        let Some(factory) = factory.as_ref() else {
            warn!("Negotiate for unknown session {}, but no session factory is registered", session_id);
            return;
        };

        match factory(session_id, myself.handle(session_id)) {
            Some(consumer) => {
                debug!("accepting new session {}", session_id);
                self.routes.update(|m| { m.insert(session_id, consumer); });
            }
            None => debug!("session factory refused session {}", session_id),
        }
    }
}

fn starts_with_session_frame(bufs: &[Bytes]) -> bool {
    bufs.first()
        .and_then(|buf| FrameSplitter::new(buf).next())
        .and_then(|body| body.ok())
        .and_then(peek_session_message)
        .is_some()
}

struct Router {
    shared: Weak<SharedTransport>,
}

impl TransportConsumer for Router {
    fn connected(&self) {
        debug!("shared transport connected");
    }

    fn disconnected(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let routes = shared.routes.update(std::mem::take);
        debug!("shared transport disconnected, notifying {} session(s)", routes.len());
        for consumer in routes.values() {
            consumer.disconnected();
        }
    }

    fn accept(&self, buf: &[u8]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        for frame in FrameSplitter::frames(buf) {
            match frame {
                Ok(frame) => shared.route(frame, &frame[FrameHeader::SERIALIZED_LEN..]),
                Err(e) => {
                    warn!("dropping unparseable inbound data: {}", e);
                    return;
                }
            }
        }
    }
}

/// One session's view of a [SharedTransport]
pub struct SharedTransportHandle {
    shared: Arc<SharedTransport>,
    session_id: Uuid,
}

impl SharedTransportHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[async_trait]
impl Transport for SharedTransportHandle {
    /// Registers `consumer` for this handle's session id and opens the underlying transport if
    ///  it is not open yet. Opening an already registered session replaces its consumer.
    async fn open(&self, consumer: Arc<dyn TransportConsumer>) -> Result<(), FixpError> {
        self.shared.routes.update(|m| { m.insert(self.session_id, consumer); });
        self.shared.ensure_open().await
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.shared.write_for(self.session_id, &[Bytes::copy_from_slice(buf)])
    }

    fn write_batch(&self, bufs: &[Bytes]) -> io::Result<usize> {
        self.shared.write_for(self.session_id, bufs)
    }

    /// Removes this session from the routing table, the underlying transport stays open
    fn close(&self) {
        self.shared.routes.update(|m| { m.remove(&self.session_id); });
        let mut context = self.shared.outbound_context.lock().unwrap_or_else(PoisonError::into_inner);
        if *context == Some(self.session_id) {
            *context = None;
        }
    }

    fn is_open(&self) -> bool {
        self.shared.underlying.is_open() && self.shared.routes.contains_key(&self.session_id)
    }
}
