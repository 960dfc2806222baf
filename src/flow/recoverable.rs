use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::FixpError;
use crate::flow::{batch_capacity, check_message_lengths, FlowContext, FlowCore, FlowSender};
use crate::messages::{put_frame, FlowType, SessionMessage};
use crate::sequencer::Sequencer;
use crate::store::MessageStore;
use crate::util::safe_converter::SafeCast;

/// Sequenced and persisted: every message is put into the [MessageStore] before it is written, so
///  that it can be retransmitted when the peer asks for it.
pub struct RecoverableFlowSender {
    core: FlowCore,
    sequencer: Sequencer,
    store: Arc<dyn MessageStore>,
}

impl RecoverableFlowSender {
    pub fn new(ctx: FlowContext, store: Arc<dyn MessageStore>) -> Arc<RecoverableFlowSender> {
        let sender = Arc::new(RecoverableFlowSender {
            sequencer: Sequencer::new(ctx.session_id),
            core: FlowCore::new(ctx),
            store,
        });
        let weak: Weak<dyn FlowSender> = Arc::downgrade(&sender) as Weak<dyn FlowSender>;
        sender.core.start_heartbeat(weak);
        sender
    }

    /// Moves the outbound position, announcing it with the next write. Only for simulating gaps.
    pub fn set_next_seq_no(&self, next_seq_no: u64) {
        let _guard = self.core.critical_section.enter();
        self.sequencer.set_next_seq_no(next_seq_no);
    }

    fn store_batch(&self, messages: &[&[u8]], last_seq_no: u64) -> Result<(), FixpError> {
        let first_seq_no = last_seq_no + 1 - messages.len().safe_cast();
        for (seq_no, message) in (first_seq_no..).zip(messages) {
            if let Err(e) = self.store.insert_message(self.core.session_id(), seq_no, Bytes::copy_from_slice(message)) {
                let e = FixpError::from(e);
                self.core.fail(&e);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl FlowSender for RecoverableFlowSender {
    fn flow_type(&self) -> FlowType {
        FlowType::Recoverable
    }

    fn send_batch(&self, messages: &[&[u8]]) -> Result<u64, FixpError> {
        check_message_lengths(messages)?;

        let batch = {
            let _guard = self.core.critical_section.enter();
            let mut buf = BytesMut::with_capacity(batch_capacity(messages));
            self.core.check_not_failed()?;
            let batch = self.sequencer.apply(messages, &mut buf);
            if !messages.is_empty() {
                // stored messages keep their numbers even if the write fails
                self.store_batch(messages, batch.last_seq_no)?;
                self.sequencer.commit(&batch);
            }
            self.core.write(&buf)?;
            self.sequencer.commit(&batch);
            batch
        };
        self.core.mark_sent();

        trace!("session {}: sent {} messages up to #{}", self.core.session_id(), messages.len(), batch.last_seq_no);
        Ok(batch.last_seq_no)
    }

    fn send_heartbeat(&self) -> Result<(), FixpError> {
        if self.core.take_heartbeat_due() {
            self.send_batch(&[])?;
        }
        Ok(())
    }

    fn send_end_of_stream(&self) -> Result<(), FixpError> {
        self.core.send_end_of_stream()
    }

    fn next_seq_no(&self) -> u64 {
        self.sequencer.next_seq_no()
    }

    /// Writes a `Retransmission` frame followed by the messages and a `Sequence` frame that
    ///  restores the regular position, all in a single write
    fn resend(&self, messages: &[Bytes], offset: usize, count: usize, from_seq_no: u64, request_timestamp: u64) -> Result<(), FixpError> {
        let end = offset.checked_add(count)
            .filter(|&end| end <= messages.len())
            .ok_or_else(|| FixpError::Protocol(format!("cannot resend {} messages at offset {} of {}", count, offset, messages.len())))?;
        let messages = &messages[offset..end];
        let count = u32::try_from(count)
            .map_err(|_| FixpError::Protocol(format!("cannot resend {} messages at once", count)))?;
        check_message_lengths(&messages.iter().map(|m| m.as_ref()).collect::<Vec<_>>())?;

        {
            let _guard = self.core.critical_section.enter();
            self.core.check_not_failed()?;
            let mut buf = BytesMut::with_capacity(128 + messages.iter().map(|m| m.len() + 6).sum::<usize>());
            SessionMessage::Retransmission {
                session_id: self.core.session_id(),
                request_timestamp,
                next_seq_no: from_seq_no,
                count,
            }.ser_framed(&mut buf);
            for message in messages {
                put_frame(&mut buf, message);
            }
            self.sequencer.sequence_frame(&mut buf);
            self.core.write(&buf)?;
        }
        self.core.mark_sent();

        debug!("session {}: resent {} messages from #{}", self.core.session_id(), count, from_seq_no);
        Ok(())
    }

    fn shutdown(&self) {
        self.core.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;
    use crate::config::ReactorConfig;
    use crate::error::StoreError;
    use crate::messages::TerminationCode;
    use crate::reactor::EventReactor;
    use crate::store::in_memory::InMemoryMessageStore;
    use crate::store::MockMessageStore;
    use crate::test_util::{app_message, RecordedFrame, RecordingTransport};

    fn session_id() -> Uuid {
        Uuid::from_u128(9)
    }

    async fn setup(store: Arc<dyn MessageStore>) -> (Arc<RecordingTransport>, Arc<RecoverableFlowSender>) {
        let reactor = Arc::new(EventReactor::new(Arc::new(ReactorConfig::default())));
        reactor.open().unwrap();
        let transport = RecordingTransport::new();
        let ctx = FlowContext {
            session_id: session_id(),
            reactor,
            transport: transport.clone(),
            keepalive_interval: Duration::from_secs(10),
            max_write_retries: 0,
        };
        (transport, RecoverableFlowSender::new(ctx, store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_stored() {
        let store = Arc::new(InMemoryMessageStore::new());
        store.open().await.unwrap();
        let (_transport, sender) = setup(store.clone()).await;

        let messages = (0..5u8).map(|i| app_message(&[i])).collect::<Vec<_>>();
        assert_eq!(sender.send(&messages[0]).unwrap(), 1);
        assert_eq!(sender.send_batch(&messages[1..].iter().map(|m| m.as_ref()).collect::<Vec<_>>()).unwrap(), 5);

        assert_eq!(store.retrieve_messages(session_id(), 1, 5).unwrap(), messages);
        assert_eq!(store.retrieve_messages(session_id(), 3, 2).unwrap(), messages[2..4].to_vec());
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_suspends() {
        let mut store = MockMessageStore::new();
        store.expect_insert_message()
            .once()
            .returning(|_, _, _| Err(StoreError::NotOpen));
        let (transport, sender) = setup(Arc::new(store)).await;

        let result = sender.send(&app_message(b"x"));
        assert!(matches!(result, Err(FixpError::Store(StoreError::NotOpen))));
        assert_eq!(sender.next_seq_no(), 1);
        assert!(transport.frames().iter().all(|f| !matches!(f, RecordedFrame::Application(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_keeps_store_and_sequence_in_step() {
        let store = Arc::new(InMemoryMessageStore::new());
        store.open().await.unwrap();
        let (transport, sender) = setup(store.clone()).await;
        transport.fail_writes(1);

        let a = app_message(b"a");
        assert!(matches!(sender.send(&a), Err(FixpError::Transport(_))));
        assert_eq!(sender.next_seq_no(), 2);
        assert_eq!(store.retrieve_messages(session_id(), 1, 1).unwrap(), vec![a.clone()]);

        assert!(matches!(sender.send(&app_message(b"b")), Err(FixpError::Closed(_))));
        assert!(matches!(sender.resend(&[a], 0, 1, 1, 0), Err(FixpError::Closed(_))));
        assert_eq!(sender.next_seq_no(), 2);
        assert_eq!(transport.session_messages(), vec![
            SessionMessage::Terminate { session_id: session_id(), code: TerminationCode::Finished, reason: None },
        ]);
        assert!(transport.frames().iter().all(|f| !matches!(f, RecordedFrame::Application(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend() {
        let store = Arc::new(InMemoryMessageStore::new());
        store.open().await.unwrap();
        let (transport, sender) = setup(store).await;

        let messages = (0..4u8).map(|i| app_message(&[i])).collect::<Vec<_>>();
        for m in &messages {
            sender.send(m).unwrap();
        }
        transport.clear();

        sender.resend(&messages, 1, 2, 2, 12345).unwrap();

        assert_eq!(transport.writes().len(), 1);
        assert_eq!(transport.frames(), vec![
            RecordedFrame::Session(SessionMessage::Retransmission { session_id: session_id(), request_timestamp: 12345, next_seq_no: 2, count: 2 }),
            RecordedFrame::Application(messages[1].clone()),
            RecordedFrame::Application(messages[2].clone()),
            RecordedFrame::Session(SessionMessage::Sequence { session_id: session_id(), next_seq_no: 5 }),
        ]);
        assert_eq!(sender.next_seq_no(), 5);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_out_of_range() {
        let (transport, sender) = setup(Arc::new(InMemoryMessageStore::new())).await;
        let messages = vec![app_message(b"a"), app_message(b"b")];

        assert!(matches!(sender.resend(&messages, 1, 2, 1, 0), Err(FixpError::Protocol(_))));
        assert!(matches!(sender.resend(&messages, usize::MAX, 2, 1, 0), Err(FixpError::Protocol(_))));
        assert!(transport.writes().is_empty());
        sender.shutdown();
    }
}
