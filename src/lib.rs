//! A FIXP style session layer: negotiation, establishment, sequencing, heartbeats and gap recovery
//!  for application messages, independent of the transport that carries them.
//!
//! An [engine::Engine] holds the shared infrastructure. Each [session::Session] is created on a
//!  [transport::Transport] and sends through one of the [flow] types; inbound application
//!  messages go to a [session::MessageConsumer].

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod messages;
pub mod reactor;
pub mod retransmitter;
pub mod sequencer;
pub mod session;
pub mod store;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;
