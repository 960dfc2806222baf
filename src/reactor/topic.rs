use bytes::Bytes;
use uuid::Uuid;

use crate::messages::TerminationCode;

/// Per-session event channels
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionEventKind {
    /// ticks of the session's own keepalive timer
    Heartbeat,
    /// ticks for monitoring the peer's keepalive
    PeerHeartbeat,
    Ready,
    Suspended,
    Terminated,
    NotApplied,
}

/// Channels that are not tied to a single session
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceEventKind {
    RetransmitRequestReceived,
}

/// Identifies an event channel. Delivery is scoped by equality: a subscriber receives exactly
///  the events posted to a topic equal to the one it subscribed to.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    Session {
        session_id: Uuid,
        kind: SessionEventKind,
    },
    Service(ServiceEventKind),
    /// application defined
    Named(String),
}

impl Topic {
    pub fn session(session_id: Uuid, kind: SessionEventKind) -> Topic {
        Topic::Session { session_id, kind }
    }

    pub fn service(kind: ServiceEventKind) -> Topic {
        Topic::Service(kind)
    }

    pub fn named(name: impl Into<String>) -> Topic {
        Topic::Named(name.into())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetransmitRequestData {
    pub session_id: Uuid,
    pub from_seq_no: u64,
    pub count: u32,
    /// the request's timestamp, echoed in the Retransmission response
    pub timestamp: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Tick,
    SessionReady {
        session_id: Uuid,
    },
    SessionSuspended {
        session_id: Uuid,
        reason: String,
    },
    SessionTerminated {
        session_id: Uuid,
        code: TerminationCode,
    },
    RetransmitRequest(RetransmitRequestData),
    NotApplied {
        session_id: Uuid,
        from_seq_no: u64,
        count: u32,
    },
    /// application defined
    Payload(Bytes),
}
