//! Topic based publish / subscribe with timers. The reactor is the only place where protocol
//!  coordination happens: heartbeat ticks, lifecycle events and retransmit requests are all
//!  posted to it and delivered by its dispatch task.
//!
//! Delivery is FIFO per topic (in fact, FIFO across all topics, but callers should not rely on
//!  that). Subscribers run on the dispatch task and are expected to return quickly - anything
//!  blocking belongs in a separate task.
//!
//! An event goes to the subscribers of its topic at the time it is posted. Unsubscribing (like
//!  cancelling a timer) affects later posts only, so a receiver may still see an event that was
//!  queued before it unsubscribed.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ReactorConfig;
use crate::error::FixpError;
use crate::util::atomic_map::AtomicMap;

pub mod topic;

pub use topic::{Event, RetransmitRequestData, ServiceEventKind, SessionEventKind, Topic};

/// Receives events for the topics it is subscribed to. Errors (and panics) are reported to the
///  reactor's error sink and do not affect other subscribers.
pub trait Receiver: Send + Sync + 'static {
    fn on_event(&self, topic: &Topic, event: &Event) -> anyhow::Result<()>;
}

impl<F> Receiver for F
where F: Fn(&Topic, &Event) -> anyhow::Result<()> + Send + Sync + 'static
{
    fn on_event(&self, topic: &Topic, event: &Event) -> anyhow::Result<()> {
        self(topic, event)
    }
}

pub type ErrorSink = Arc<dyn Fn(&Topic, &anyhow::Error) + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    active: AtomicBool,
    receiver: Box<dyn Receiver>,
}

/// A posted event together with the subscribers it goes to
struct Delivery {
    topic: Topic,
    event: Event,
    subscribers: Vec<Arc<SubscriberEntry>>,
}

struct ReactorShared {
    config: Arc<ReactorConfig>,
    subscriptions: AtomicMap<Topic, Vec<Arc<SubscriberEntry>>>,
    next_subscriber_id: AtomicU64,
    queue: mpsc::UnboundedSender<Delivery>,
    backlog: AtomicUsize,
    closed: AtomicBool,
    error_sink: ErrorSink,
}

impl ReactorShared {
    fn enqueue(&self, topic: Topic, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            trace!("{}: closed, dropping event for {:?}", self.config.name, topic);
            return;
        }

        let Some(subscribers) = self.subscriptions.get(&topic) else {
            trace!("{}: no subscribers for {:?}", self.config.name, topic);
            return;
        };

        let backlog = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if backlog == self.config.queue_warn_threshold {
            warn!("{}: {} events are waiting for delivery - is a subscriber blocking?", self.config.name, backlog);
        }

        if self.queue.send(Delivery { topic, event, subscribers }).is_err() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            debug!("{}: dispatch loop is gone, dropping event", self.config.name);
        }
    }

    fn dispatch(&self, delivery: &Delivery) {
        let Delivery { topic, event, subscribers } = delivery;
        for subscriber in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.receiver.on_event(topic, event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => (self.error_sink)(topic, &e),
                Err(panic) => {
                    let e = anyhow!("subscriber panicked: {}", panic_message(panic.as_ref()));
                    (self.error_sink)(topic, &e)
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    }
    else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    }
    else {
        "<non-string payload>"
    }
}

enum DispatchState {
    Created(mpsc::UnboundedReceiver<Delivery>),
    Running(JoinHandle<()>),
    Closed,
}

pub struct EventReactor {
    shared: Arc<ReactorShared>,
    state: Mutex<DispatchState>,
}

impl EventReactor {
    pub fn new(config: Arc<ReactorConfig>) -> EventReactor {
        let name = config.name.clone();
        Self::with_error_sink(config, Arc::new(move |topic: &Topic, e: &anyhow::Error| {
            error!("{}: subscriber for {:?} failed: {:#}", name, topic, e);
        }))
    }

    pub fn with_error_sink(config: Arc<ReactorConfig>, error_sink: ErrorSink) -> EventReactor {
        let (send, recv) = mpsc::unbounded_channel();
        EventReactor {
            shared: Arc::new(ReactorShared {
                config,
                subscriptions: AtomicMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                queue: send,
                backlog: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                error_sink,
            }),
            state: Mutex::new(DispatchState::Created(recv)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Starts the dispatch task. Events posted before this call are buffered and delivered once
    ///  the reactor is open. Opening an open reactor has no effect, opening a closed one fails.
    ///
    /// NB: must be called from within a tokio runtime
    pub fn open(&self) -> Result<(), FixpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, DispatchState::Closed) {
            DispatchState::Created(recv) => {
                info!("{}: opening", self.name());
                *state = DispatchState::Running(tokio::spawn(dispatch_loop(self.shared.clone(), recv)));
                Ok(())
            }
            running @ DispatchState::Running(_) => {
                *state = running;
                Ok(())
            }
            DispatchState::Closed => Err(FixpError::Closed("event reactor")),
        }
    }

    /// Stops delivery and all timers. Events that were posted but not delivered yet are discarded.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let DispatchState::Running(handle) = std::mem::replace(&mut *state, DispatchState::Closed) {
            info!("{}: closing", self.name());
            handle.abort();
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap_or_else(PoisonError::into_inner), DispatchState::Running(_))
    }

    pub fn subscribe(&self, topic: Topic, receiver: impl Receiver) -> Subscription {
        let entry = Arc::new(SubscriberEntry {
            id: self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            receiver: Box::new(receiver),
        });

        trace!("{}: subscribing #{} to {:?}", self.name(), entry.id, topic);
        self.shared.subscriptions.update(|m| {
            m.entry(topic.clone())
                .or_default()
                .push(entry.clone());
        });

        Subscription {
            topic,
            entry,
            reactor: Arc::downgrade(&self.shared),
        }
    }

    /// Posting is non-blocking and may happen from any thread
    pub fn post(&self, topic: Topic, event: Event) {
        self.shared.enqueue(topic, event);
    }

    /// Posts `event` to `topic` repeatedly, first after one `interval` has elapsed.
    ///
    /// NB: must be called from within a tokio runtime
    pub fn post_at_interval(&self, topic: Topic, event: Event, interval: Duration) -> TimerSchedule {
        let interval = interval.max(Duration::from_millis(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let reactor = Arc::downgrade(&self.shared);

        let task_topic = topic.clone();
        let task_cancelled = cancelled.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !fire(&reactor, &task_cancelled, &task_topic, &event) {
                    break;
                }
            }
        });

        TimerSchedule {
            topic,
            cancelled,
            handle: handle.abort_handle(),
        }
    }

    /// Posts `event` to `topic` once after `delay`
    ///
    /// NB: must be called from within a tokio runtime
    pub fn post_after(&self, topic: Topic, event: Event, delay: Duration) -> TimerSchedule {
        let cancelled = Arc::new(AtomicBool::new(false));
        let reactor = Arc::downgrade(&self.shared);

        let task_topic = topic.clone();
        let task_cancelled = cancelled.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(&reactor, &task_cancelled, &task_topic, &event);
        });

        TimerSchedule {
            topic,
            cancelled,
            handle: handle.abort_handle(),
        }
    }
}

impl Drop for EventReactor {
    fn drop(&mut self) {
        self.close();
    }
}

/// returns `false` if the timer should stop
fn fire(reactor: &Weak<ReactorShared>, cancelled: &AtomicBool, topic: &Topic, event: &Event) -> bool {
    if cancelled.load(Ordering::Acquire) {
        return false;
    }
    let Some(reactor) = reactor.upgrade() else {
        return false;
    };
    if reactor.closed.load(Ordering::Acquire) {
        return false;
    }
    reactor.enqueue(topic.clone(), event.clone());
    true
}

async fn dispatch_loop(shared: Arc<ReactorShared>, mut recv: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = recv.recv().await {
        shared.dispatch(&delivery);
        shared.backlog.fetch_sub(1, Ordering::Relaxed);
    }
    debug!("{}: dispatch loop terminated", shared.config.name);
}

/// A registered receiver. Dropping a subscription does *not* unsubscribe it.
pub struct Subscription {
    topic: Topic,
    entry: Arc<SubscriberEntry>,
    reactor: Weak<ReactorShared>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }

    /// Stops delivery of events posted after this call. Events that are already queued are still
    ///  delivered. Calling this more than once has no effect.
    pub fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        trace!("{}: unsubscribing #{} from {:?}", reactor.config.name, self.entry.id, self.topic);
        reactor.subscriptions.update(|m| {
            if let Some(subscribers) = m.get_mut(&self.topic) {
                subscribers.retain(|s| s.id != self.entry.id);
                if subscribers.is_empty() {
                    m.remove(&self.topic);
                }
            }
        });
    }
}

pub struct TimerSchedule {
    topic: Topic,
    cancelled: Arc<AtomicBool>,
    handle: AbortHandle,
}

impl TimerSchedule {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Stops future firings. A firing that was already posted is still delivered.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
