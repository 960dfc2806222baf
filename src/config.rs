use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use uuid::Uuid;

use crate::messages::FlowType;

pub struct ReactorConfig {
    /// Used as a prefix in log output, helpful when several reactors run in one process
    pub name: String,

    /// A warning is logged when the number of events posted but not yet delivered reaches this
    ///  number. Subscribers are expected to be fast, a growing backlog is a symptom of one that
    ///  is not.
    pub queue_warn_threshold: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            name: "fixp-reactor".to_string(),
            queue_warn_threshold: 10_000,
        }
    }
}

impl ReactorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_warn_threshold == 0 {
            bail!("queue warn threshold must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum SessionRole {
    /// Initiates the session, presenting credentials in its Negotiate message
    Client { credentials: Bytes },
    /// Waits for a client's Negotiate and validates the credentials
    Server,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: SessionRole,

    /// For clients, a fresh id is generated if none is configured. Servers learn the id from
    ///  the client's Negotiate message and ignore this.
    pub session_id: Option<Uuid>,

    /// The flow type for messages sent by this side
    pub outbound_flow: FlowType,

    /// The interval at which this side sends heartbeats when there is no application traffic.
    ///  It is announced to the peer in Establish / EstablishmentAck.
    pub keepalive_interval: Duration,

    /// The session is terminated if nothing is received from the peer for this many of the
    ///  peer's keepalive intervals
    pub peer_keepalive_tolerance: u32,

    /// The maximum time `open()` waits for the session to become established
    pub negotiation_timeout: Duration,

    /// The maximum time `close()` waits for the peer to acknowledge termination
    pub finalize_timeout: Duration,

    /// A write that the transport does not accept (backpressure) is retried this many times
    ///  before it is treated as a transport failure
    pub max_write_retries: u32,

    /// Upper bound for the number of messages a peer may request in a single RetransmitRequest
    pub max_retransmit_count: u32,
}

impl SessionConfig {
    pub fn client(credentials: impl Into<Bytes>, outbound_flow: FlowType) -> SessionConfig {
        Self::with_role(SessionRole::Client { credentials: credentials.into() }, outbound_flow)
    }

    pub fn server(outbound_flow: FlowType) -> SessionConfig {
        Self::with_role(SessionRole::Server, outbound_flow)
    }

    fn with_role(role: SessionRole, outbound_flow: FlowType) -> SessionConfig {
        SessionConfig {
            role,
            session_id: None,
            outbound_flow,
            keepalive_interval: Duration::from_millis(1000),
            peer_keepalive_tolerance: 3,
            negotiation_timeout: Duration::from_millis(3000),
            finalize_timeout: Duration::from_millis(1000),
            max_write_retries: 100,
            max_retransmit_count: 10_000,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, SessionRole::Client { .. })
    }

    pub fn keepalive_millis(&self) -> u32 {
        self.keepalive_interval.as_millis().try_into().unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_interval.as_millis() == 0 {
            bail!("keepalive interval must be at least one millisecond");
        }
        if self.keepalive_interval.as_millis() > u32::MAX as u128 {
            bail!("keepalive interval does not fit the wire format");
        }
        if self.peer_keepalive_tolerance == 0 {
            bail!("peer keepalive tolerance must be positive");
        }
        if self.negotiation_timeout.is_zero() || self.finalize_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.max_retransmit_count == 0 {
            bail!("max retransmit count must be positive");
        }
        if self.session_id == Some(Uuid::nil()) {
            bail!("the nil UUID is not a valid session id");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct EngineConfig {
    pub reactor: ReactorConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.reactor.validate()
    }
}
