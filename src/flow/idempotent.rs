use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tracing::trace;

use crate::error::FixpError;
use crate::flow::{batch_capacity, check_message_lengths, FlowContext, FlowCore, FlowSender};
use crate::messages::FlowType;
use crate::sequencer::Sequencer;

/// Sequenced, but not persisted: a receiver that detects a gap is told the messages were not
///  applied, and nothing is ever resent.
pub struct IdempotentFlowSender {
    core: FlowCore,
    sequencer: Sequencer,
}

impl IdempotentFlowSender {
    pub fn new(ctx: FlowContext) -> Arc<IdempotentFlowSender> {
        let sender = Arc::new(IdempotentFlowSender {
            sequencer: Sequencer::new(ctx.session_id),
            core: FlowCore::new(ctx),
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
}

impl FlowSender for IdempotentFlowSender {
    fn flow_type(&self) -> FlowType {
        FlowType::Idempotent
    }

    fn send_batch(&self, messages: &[&[u8]]) -> Result<u64, FixpError> {
        check_message_lengths(messages)?;

        let batch = {
            let _guard = self.core.critical_section.enter();
            let mut buf = BytesMut::with_capacity(batch_capacity(messages));
            self.core.check_not_failed()?;
            let batch = self.sequencer.apply(messages, &mut buf);
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

    fn shutdown(&self) {
        self.core.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;
    use crate::config::ReactorConfig;
    use crate::messages::{SessionMessage, TemplateId, TerminationCode};
    use crate::reactor::{Event, EventReactor, SessionEventKind, Topic};
    use crate::test_util::{app_message, RecordedFrame, RecordingTransport};

    fn setup(keepalive_millis: u64, max_write_retries: u32) -> (Arc<EventReactor>, Arc<RecordingTransport>, FlowContext) {
        let reactor = Arc::new(EventReactor::new(Arc::new(ReactorConfig::default())));
        reactor.open().unwrap();
        let transport = RecordingTransport::new();
        let ctx = FlowContext {
            session_id: Uuid::from_u128(7),
            reactor: reactor.clone(),
            transport: transport.clone(),
            keepalive_interval: Duration::from_millis(keepalive_millis),
            max_write_retries,
        };
        (reactor, transport, ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers() {
        let (_reactor, transport, ctx) = setup(10_000, 0);
        let sender = IdempotentFlowSender::new(ctx);
        let msg = app_message(b"abc");

        assert_eq!(sender.send(&msg).unwrap(), 1);
        assert_eq!(sender.send(&msg).unwrap(), 2);
        assert_eq!(sender.send_batch(&[&msg[..], &msg[..]]).unwrap(), 4);
        assert_eq!(sender.next_seq_no(), 5);

        assert_eq!(transport.frames(), vec![
            RecordedFrame::Session(SessionMessage::Sequence { session_id: Uuid::from_u128(7), next_seq_no: 1 }),
            RecordedFrame::Application(msg.clone()),
            RecordedFrame::Application(msg.clone()),
            RecordedFrame::Application(msg.clone()),
            RecordedFrame::Application(msg.clone()),
        ]);
        assert_eq!(transport.writes().len(), 3);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_traffic_has_one_sequence_frame() {
        let (_reactor, transport, ctx) = setup(100, 0);
        let sender = IdempotentFlowSender::new(ctx);
        let msg = app_message(b"abc");

        for _ in 0..40 {
            sender.send(&msg).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert_eq!(transport.count(TemplateId::Sequence), 1);
        assert_eq!(transport.frames().len(), 41);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_suppressed_after_send() {
        let (_reactor, transport, ctx) = setup(100, 0);
        let sender = IdempotentFlowSender::new(ctx);
        let msg = app_message(b"abc");

        tokio::time::sleep(Duration::from_millis(50)).await;
        sender.send(&msg).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.count(TemplateId::Sequence), 1, "the tick after a send must not emit a heartbeat");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.count(TemplateId::Sequence), 2, "an idle tick emits a heartbeat");
        assert_eq!(transport.session_messages().last(), Some(&SessionMessage::Sequence { session_id: Uuid::from_u128(7), next_seq_no: 2 }));
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_suspends() {
        let (reactor, transport, ctx) = setup(100, 0);
        let suspended = Arc::new(Mutex::new(Vec::new()));
        let suspended2 = suspended.clone();
        let _subscription = reactor.subscribe(Topic::session(Uuid::from_u128(7), SessionEventKind::Suspended), move |_: &Topic, event: &Event| -> anyhow::Result<()> {
            suspended2.lock().unwrap().push(event.clone());
            Ok(())
        });

        let sender = IdempotentFlowSender::new(ctx);
        transport.fail_writes(1);

        let result = sender.send(&app_message(b"abc"));
        assert!(matches!(result, Err(FixpError::Transport(_))));
        assert_eq!(sender.next_seq_no(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(suspended.lock().unwrap().len(), 1);
        assert_eq!(transport.session_messages(), vec![
            SessionMessage::Terminate { session_id: Uuid::from_u128(7), code: TerminationCode::Finished, reason: None },
        ]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.count(TemplateId::Sequence), 0, "heartbeats stop after a failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_tick_after_shutdown_is_ignored() {
        let (reactor, transport, ctx) = setup(10_000, 0);
        let sender = IdempotentFlowSender::new(ctx);

        reactor.post(Topic::session(Uuid::from_u128(7), SessionEventKind::Heartbeat), Event::Tick);
        sender.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_write_failure_is_rejected() {
        let (_reactor, transport, ctx) = setup(10_000, 0);
        let sender = IdempotentFlowSender::new(ctx);
        transport.fail_writes(1);

        assert!(matches!(sender.send(&app_message(b"a")), Err(FixpError::Transport(_))));
        assert!(matches!(sender.send(&app_message(b"b")), Err(FixpError::Closed(_))));
        assert_eq!(sender.next_seq_no(), 1);
        assert_eq!(transport.writes().len(), 1, "only the Terminate after the failure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_is_retried() {
        let (_reactor, transport, ctx) = setup(10_000, 5);
        let sender = IdempotentFlowSender::new(ctx);
        transport.backpressure_writes(3);

        assert_eq!(sender.send(&app_message(b"abc")).unwrap(), 1);
        assert_eq!(transport.writes().len(), 1);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream() {
        let (_reactor, transport, ctx) = setup(100, 0);
        let sender = IdempotentFlowSender::new(ctx);

        sender.send_end_of_stream().unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(transport.session_messages(), vec![
            SessionMessage::Terminate { session_id: Uuid::from_u128(7), code: TerminationCode::Finished, reason: None },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_next_seq_no() {
        let (_reactor, transport, ctx) = setup(10_000, 0);
        let sender = IdempotentFlowSender::new(ctx);
        let msg = app_message(b"abc");

        sender.send(&msg).unwrap();
        sender.set_next_seq_no(5);
        assert_eq!(sender.send(&msg).unwrap(), 5);

        let sequences = transport.session_messages().into_iter()
            .filter_map(|m| match m {
                SessionMessage::Sequence { next_seq_no, .. } => Some(next_seq_no),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 5]);
        sender.shutdown();
    }
}
