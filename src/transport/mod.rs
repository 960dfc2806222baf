//! The abstraction of the medium that carries a session's frames. Writes are synchronous and
//!  non-blocking: a transport that cannot accept a buffer right now returns `Ok(0)`, and it is
//!  up to the caller to retry.

pub mod pipe;
pub mod shared;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};

use crate::error::FixpError;

/// This trait decouples the session from the source of inbound frames. It is passed around as an
///  `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[cfg_attr(test, automock)]
pub trait TransportConsumer: Send + Sync + 'static {
    fn connected(&self);

    fn disconnected(&self);

    /// `buf` holds one or more complete frames
    fn accept(&self, buf: &[u8]);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts delivery of inbound frames to `consumer`
    async fn open(&self, consumer: Arc<dyn TransportConsumer>) -> Result<(), FixpError>;

    /// Returns the number of bytes written, 0 signalling backpressure
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Writes several buffers as a single unit, without other writes interleaving
    fn write_batch(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let mut joined = BytesMut::with_capacity(bufs.iter().map(|b| b.len()).sum());
        for b in bufs {
            joined.put_slice(b);
        }
        self.write(&joined)
    }

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Writes `buf`, retrying up to `max_retries` times while the transport signals backpressure.
///  Backpressure that outlasts the retries is reported as an error.
pub fn write_with_retry(transport: &dyn Transport, buf: &[u8], max_retries: u32) -> Result<usize, FixpError> {
    for attempt in 0..=max_retries {
        let written = transport.write(buf)?;
        if written > 0 || buf.is_empty() {
            return Ok(written);
        }
        trace!("transport backpressure, attempt #{}", attempt);
        std::thread::yield_now();
    }
    debug!("transport did not accept a {} byte write after {} retries", buf.len(), max_retries);
    Err(FixpError::Transport(io::Error::new(io::ErrorKind::WouldBlock, "persistent transport backpressure")))
}
