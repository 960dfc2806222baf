use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tracing::trace;

use crate::error::FixpError;
use crate::flow::{batch_capacity, check_message_lengths, FlowContext, FlowCore, FlowSender};
use crate::messages::{put_frame, FlowType, SessionMessage};

/// Fire and forget. The sender of a `None` flow only heartbeats, it does not send application
///  messages at all.
pub struct UnsequencedFlowSender {
    core: FlowCore,
    flow_type: FlowType,
}

impl UnsequencedFlowSender {
    pub fn new(ctx: FlowContext, flow_type: FlowType) -> Arc<UnsequencedFlowSender> {
        let sender = Arc::new(UnsequencedFlowSender {
            core: FlowCore::new(ctx),
            flow_type,
        });
        let weak: Weak<dyn FlowSender> = Arc::downgrade(&sender) as Weak<dyn FlowSender>;
        sender.core.start_heartbeat(weak);
        sender
    }

    fn write_heartbeat(&self) -> Result<(), FixpError> {
        {
            let _guard = self.core.critical_section.enter();
            let mut buf = BytesMut::with_capacity(32);
            SessionMessage::UnsequencedHeartbeat { session_id: self.core.session_id() }
                .ser_framed(&mut buf);
            self.core.write(&buf)?;
        }
        self.core.mark_sent();
        Ok(())
    }
}

impl FlowSender for UnsequencedFlowSender {
    fn flow_type(&self) -> FlowType {
        self.flow_type
    }

    fn send_batch(&self, messages: &[&[u8]]) -> Result<u64, FixpError> {
        if self.flow_type == FlowType::None {
            return Err(FixpError::Protocol("the outbound flow is None, it does not carry application messages".to_string()));
        }
        check_message_lengths(messages)?;
        if messages.is_empty() {
            return Ok(0);
        }

        {
            let _guard = self.core.critical_section.enter();
            self.core.check_not_failed()?;
            let mut buf = BytesMut::with_capacity(batch_capacity(messages));
            for message in messages {
                put_frame(&mut buf, message);
            }
            self.core.write(&buf)?;
        }
        self.core.mark_sent();

        trace!("session {}: sent {} unsequenced messages", self.core.session_id(), messages.len());
        Ok(0)
    }

    fn send_heartbeat(&self) -> Result<(), FixpError> {
        if self.core.take_heartbeat_due() {
            self.write_heartbeat()?;
        }
        Ok(())
    }

    fn send_end_of_stream(&self) -> Result<(), FixpError> {
        self.core.send_end_of_stream()
    }

    fn next_seq_no(&self) -> u64 {
        0
    }

    fn shutdown(&self) {
        self.core.stop_heartbeat();
    }
}
