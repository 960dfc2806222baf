use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::FixpError;
use crate::transport::{Transport, TransportConsumer};

/// One end of an in-memory loopback connection. Each write is delivered to the other end's
///  consumer as a unit; a full channel is reported as backpressure.
pub struct PipeTransport {
    name: String,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    is_open: AtomicBool,
}

impl PipeTransport {
    /// `capacity` is the number of writes that can be in flight in each direction
    pub fn pair(capacity: usize) -> (Arc<PipeTransport>, Arc<PipeTransport>) {
        let (send_a, recv_a) = mpsc::channel(capacity);
        let (send_b, recv_b) = mpsc::channel(capacity);
        (
            Arc::new(PipeTransport::new("pipe-a", send_a, recv_b)),
            Arc::new(PipeTransport::new("pipe-b", send_b, recv_a)),
        )
    }

    fn new(name: &str, outbound: mpsc::Sender<Bytes>, inbound: mpsc::Receiver<Bytes>) -> PipeTransport {
        PipeTransport {
            name: name.to_string(),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            delivery: Mutex::new(None),
            is_open: AtomicBool::new(false),
        }
    }

    fn send(&self, buf: Bytes) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, format!("{} is not open", self.name)));
        }

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(outbound) = outbound.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, format!("{} is closed", self.name)));
        };

        let len = buf.len();
        match outbound.try_send(buf) {
            Ok(()) => {
                trace!("{}: wrote {} bytes", self.name, len);
                Ok(len)
            }
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, format!("{}: peer is closed", self.name))),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn open(&self, consumer: Arc<dyn TransportConsumer>) -> Result<(), FixpError> {
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| FixpError::Transport(io::Error::new(io::ErrorKind::AlreadyExists, format!("{} was opened before", self.name))))?;

        debug!("{}: opening", self.name);
        self.is_open.store(true, Ordering::Release);
        consumer.connected();

        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            while let Some(buf) = inbound.recv().await {
                consumer.accept(&buf);
            }
            debug!("{}: peer closed", name);
            consumer.disconnected();
        });
        *self.delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.send(Bytes::copy_from_slice(buf))
    }

    fn write_batch(&self, bufs: &[Bytes]) -> io::Result<usize> {
        if let [single] = bufs {
            return self.send(single.clone());
        }
        let mut joined = BytesMut::with_capacity(bufs.iter().map(|b| b.len()).sum());
        for b in bufs {
            joined.put_slice(b);
        }
        self.send(joined.freeze())
    }

    /// Stops delivery to this end's consumer and signals `disconnected` to the peer once it has
    ///  consumed all frames written before
    fn close(&self) {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("{}: closing", self.name);
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = self.delivery.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }
}
