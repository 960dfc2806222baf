use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tracing::{debug, warn};

use crate::reactor::{Event, EventReactor, RetransmitRequestData, ServiceEventKind, Subscription, Topic};
use crate::session::Sessions;
use crate::store::MessageStore;

/// Serves the peers' RetransmitRequests from the [MessageStore].
///
/// Requests arrive as reactor events that sessions post after validating the requested range.
///  A message missing from the store is an inconsistency that is reported through the reactor's
///  error sink: the response is never partial.
pub struct Retransmitter {
    reactor: Arc<EventReactor>,
    store: Arc<dyn MessageStore>,
    sessions: Arc<Sessions>,
    subscription: Mutex<Option<Subscription>>,
    /// requests that were queued before `close` are dropped
    active: Arc<AtomicBool>,
}

impl Retransmitter {
    pub fn new(reactor: Arc<EventReactor>, store: Arc<dyn MessageStore>, sessions: Arc<Sessions>) -> Retransmitter {
        Retransmitter {
            reactor,
            store,
            sessions,
            subscription: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(&self) {
        let mut subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return;
        }

        self.active.store(true, Ordering::Release);
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let active = self.active.clone();
        *subscription = Some(self.reactor.subscribe(
            Topic::service(ServiceEventKind::RetransmitRequestReceived),
            move |_: &Topic, event: &Event| -> anyhow::Result<()> {
                match event {
                    Event::RetransmitRequest(request) if active.load(Ordering::Acquire) => handle_request(store.as_ref(), &sessions, request),
                    _ => Ok(()),
                }
            }));
        debug!("retransmitter open");
    }

    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.active.store(false, Ordering::Release);
            subscription.unsubscribe();
            debug!("retransmitter closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

fn handle_request(store: &dyn MessageStore, sessions: &Sessions, request: &RetransmitRequestData) -> anyhow::Result<()> {
    let Some(session) = sessions.get_session(&request.session_id) else {
        warn!("retransmit request for unknown session {} - dropping", request.session_id);
        return Ok(());
    };

    let messages = store.retrieve_messages(request.session_id, request.from_seq_no, request.count)
        .with_context(|| format!("retrieving {} messages from #{} for session {}", request.count, request.from_seq_no, request.session_id))?;

    debug!("session {}: retransmitting {} messages from #{}", request.session_id, messages.len(), request.from_seq_no);
    session.resend(&messages, 0, messages.len(), request.from_seq_no, request.timestamp)?;
    Ok(())
}
