/// The life cycle of a session. States only ever move forward, in this order, though a session
///  may skip directly to `Terminated` from any state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum SessionState {
    Uninitialized,
    /// Negotiate sent (client) or received and being validated (server)
    Negotiating,
    /// Establish sent (client) or waiting for Establish (server)
    Establishing,
    Established,
    /// This side sent Terminate and waits for the peer's Terminate
    Finalizing,
    Terminated,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        *self == SessionState::Established
    }

    pub fn is_terminated(&self) -> bool {
        *self == SessionState::Terminated
    }
}
