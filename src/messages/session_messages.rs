use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::messages::{FlowType, FrameHeader, MessageHeader, TerminationCode, SESSION_SCHEMA_ID, SESSION_SCHEMA_VERSION};
use crate::util::buf::{put_bytes, put_optional_string, put_uuid, try_get_bytes, try_get_optional_string, try_get_uuid};
use crate::util::safe_converter::PrecheckedCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum TemplateId {
    Negotiate = 500,
    NegotiationResponse = 501,
    NegotiationReject = 502,
    Establish = 503,
    EstablishmentAck = 504,
    EstablishmentReject = 505,
    Sequence = 506,
    Terminate = 507,
    RetransmitRequest = 508,
    Retransmission = 509,
    NotApplied = 510,
    UnsequencedHeartbeat = 511,
}

impl TemplateId {
    /// length of the fixed-size part of the message body, i.e. without variable length data
    pub fn block_length(&self) -> usize {
        const ID: usize = 16;
        const TIMESTAMP: usize = size_of::<u64>();
        const SEQ_NO: usize = size_of::<u64>();
        const ENUM: usize = size_of::<u8>();

        match self {
            TemplateId::Negotiate => ID + TIMESTAMP + ENUM,
            TemplateId::NegotiationResponse => ID + TIMESTAMP + ENUM,
            TemplateId::NegotiationReject => ID + TIMESTAMP + ENUM,
            TemplateId::Establish => ID + TIMESTAMP + size_of::<u32>() + SEQ_NO,
            TemplateId::EstablishmentAck => ID + TIMESTAMP + size_of::<u32>() + SEQ_NO,
            TemplateId::EstablishmentReject => ID + TIMESTAMP + ENUM,
            TemplateId::Sequence => ID + SEQ_NO,
            TemplateId::Terminate => ID + ENUM,
            TemplateId::RetransmitRequest => ID + TIMESTAMP + SEQ_NO + size_of::<u32>(),
            TemplateId::Retransmission => ID + TIMESTAMP + SEQ_NO + size_of::<u32>(),
            TemplateId::NotApplied => ID + SEQ_NO + size_of::<u32>(),
            TemplateId::UnsequencedHeartbeat => ID,
        }
    }
}

/// Session layer control messages. Timestamps are nanoseconds since the epoch; `request_timestamp`
///  fields echo the timestamp of the message they respond to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionMessage {
    Negotiate {
        session_id: Uuid,
        timestamp: u64,
        client_flow: FlowType,
        credentials: Bytes,
    },
    NegotiationResponse {
        session_id: Uuid,
        request_timestamp: u64,
        server_flow: FlowType,
    },
    NegotiationReject {
        session_id: Uuid,
        request_timestamp: u64,
        code: TerminationCode,
        reason: Option<String>,
    },
    Establish {
        session_id: Uuid,
        timestamp: u64,
        keepalive_millis: u32,
        next_seq_no: u64,
    },
    EstablishmentAck {
        session_id: Uuid,
        request_timestamp: u64,
        keepalive_millis: u32,
        next_seq_no: u64,
    },
    EstablishmentReject {
        session_id: Uuid,
        request_timestamp: u64,
        code: TerminationCode,
        reason: Option<String>,
    },
    Sequence {
        session_id: Uuid,
        next_seq_no: u64,
    },
    Terminate {
        session_id: Uuid,
        code: TerminationCode,
        reason: Option<String>,
    },
    RetransmitRequest {
        session_id: Uuid,
        timestamp: u64,
        from_seq_no: u64,
        count: u32,
    },
    Retransmission {
        session_id: Uuid,
        request_timestamp: u64,
        next_seq_no: u64,
        count: u32,
    },
    NotApplied {
        session_id: Uuid,
        from_seq_no: u64,
        count: u32,
    },
    UnsequencedHeartbeat {
        session_id: Uuid,
    },
}

impl SessionMessage {
    pub fn template_id(&self) -> TemplateId {
        match self {
            SessionMessage::Negotiate { .. } => TemplateId::Negotiate,
            SessionMessage::NegotiationResponse { .. } => TemplateId::NegotiationResponse,
            SessionMessage::NegotiationReject { .. } => TemplateId::NegotiationReject,
            SessionMessage::Establish { .. } => TemplateId::Establish,
            SessionMessage::EstablishmentAck { .. } => TemplateId::EstablishmentAck,
            SessionMessage::EstablishmentReject { .. } => TemplateId::EstablishmentReject,
            SessionMessage::Sequence { .. } => TemplateId::Sequence,
            SessionMessage::Terminate { .. } => TemplateId::Terminate,
            SessionMessage::RetransmitRequest { .. } => TemplateId::RetransmitRequest,
            SessionMessage::Retransmission { .. } => TemplateId::Retransmission,
            SessionMessage::NotApplied { .. } => TemplateId::NotApplied,
            SessionMessage::UnsequencedHeartbeat { .. } => TemplateId::UnsequencedHeartbeat,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            SessionMessage::Negotiate { session_id, .. } |
            SessionMessage::NegotiationResponse { session_id, .. } |
            SessionMessage::NegotiationReject { session_id, .. } |
            SessionMessage::Establish { session_id, .. } |
            SessionMessage::EstablishmentAck { session_id, .. } |
            SessionMessage::EstablishmentReject { session_id, .. } |
            SessionMessage::Sequence { session_id, .. } |
            SessionMessage::Terminate { session_id, .. } |
            SessionMessage::RetransmitRequest { session_id, .. } |
            SessionMessage::Retransmission { session_id, .. } |
            SessionMessage::NotApplied { session_id, .. } |
            SessionMessage::UnsequencedHeartbeat { session_id } => *session_id,
        }
    }

    /// Writes the message header and message body, without a frame header
    pub fn ser(&self, buf: &mut BytesMut) {
        let template_id = self.template_id();
        MessageHeader {
            block_length: template_id.block_length().prechecked_cast(),
            template_id: template_id.into(),
            schema_id: SESSION_SCHEMA_ID,
            version: SESSION_SCHEMA_VERSION,
        }.ser(buf);

        match self {
            SessionMessage::Negotiate { session_id, timestamp, client_flow, credentials } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*timestamp);
                buf.put_u8((*client_flow).into());
                put_bytes(buf, credentials);
            }
            SessionMessage::NegotiationResponse { session_id, request_timestamp, server_flow } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*request_timestamp);
                buf.put_u8((*server_flow).into());
            }
            SessionMessage::NegotiationReject { session_id, request_timestamp, code, reason } |
            SessionMessage::EstablishmentReject { session_id, request_timestamp, code, reason } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*request_timestamp);
                buf.put_u8((*code).into());
                put_optional_string(buf, reason.as_deref());
            }
            SessionMessage::Establish { session_id, timestamp, keepalive_millis, next_seq_no } |
            SessionMessage::EstablishmentAck { session_id, request_timestamp: timestamp, keepalive_millis, next_seq_no } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*timestamp);
                buf.put_u32_le(*keepalive_millis);
                buf.put_u64_le(*next_seq_no);
            }
            SessionMessage::Sequence { session_id, next_seq_no } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*next_seq_no);
            }
            SessionMessage::Terminate { session_id, code, reason } => {
                put_uuid(buf, session_id);
                buf.put_u8((*code).into());
                put_optional_string(buf, reason.as_deref());
            }
            SessionMessage::RetransmitRequest { session_id, timestamp, from_seq_no: seq_no, count } |
            SessionMessage::Retransmission { session_id, request_timestamp: timestamp, next_seq_no: seq_no, count } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*timestamp);
                buf.put_u64_le(*seq_no);
                buf.put_u32_le(*count);
            }
            SessionMessage::NotApplied { session_id, from_seq_no, count } => {
                put_uuid(buf, session_id);
                buf.put_u64_le(*from_seq_no);
                buf.put_u32_le(*count);
            }
            SessionMessage::UnsequencedHeartbeat { session_id } => {
                put_uuid(buf, session_id);
            }
        }
    }

    /// Writes the message as a complete frame, i.e. preceded by a frame header
    pub fn ser_framed(&self, buf: &mut BytesMut) {
        let start = buf.len();
        FrameHeader::for_body(0).ser(buf);
        self.ser(buf);

        let frame_len: u32 = (buf.len() - start).prechecked_cast();
        buf[start..start + size_of::<u32>()].copy_from_slice(&frame_len.to_be_bytes());
    }

    /// Parses a session message from a frame body, including the message header
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let header = MessageHeader::deser(buf)?;
        if header.schema_id != SESSION_SCHEMA_ID {
            bail!("schema id {} is not the session schema", header.schema_id);
        }
        Self::deser_body(&header, buf)
    }

    /// Parses the message body following `header`. Fixed-size blocks longer than expected are
    ///  accepted and the additional bytes skipped, so that newer schema versions can add fields.
    pub fn deser_body(header: &MessageHeader, buf: &mut impl Buf) -> anyhow::Result<SessionMessage> {
        let template_id = TemplateId::try_from(header.template_id)?;

        let block_length = header.block_length as usize;
        if block_length < template_id.block_length() {
            bail!("block length {} is too short for {:?}, expected at least {}", block_length, template_id, template_id.block_length());
        }
        if buf.remaining() < block_length {
            bail!("buffer underflow: block length {} for {:?}, {} bytes remaining", block_length, template_id, buf.remaining());
        }
        let mut block = buf.copy_to_bytes(block_length);

        let session_id = try_get_uuid(&mut block)?;
        let result = match template_id {
            TemplateId::Negotiate => {
                let timestamp = block.try_get_u64_le()?;
                let client_flow = FlowType::try_from(block.try_get_u8()?)?;
                let credentials = try_get_bytes(buf)?;
                SessionMessage::Negotiate { session_id, timestamp, client_flow, credentials }
            }
            TemplateId::NegotiationResponse => {
                let request_timestamp = block.try_get_u64_le()?;
                let server_flow = FlowType::try_from(block.try_get_u8()?)?;
                SessionMessage::NegotiationResponse { session_id, request_timestamp, server_flow }
            }
            TemplateId::NegotiationReject => {
                let request_timestamp = block.try_get_u64_le()?;
                let code = TerminationCode::try_from(block.try_get_u8()?)?;
                let reason = try_get_optional_string(buf)?;
                SessionMessage::NegotiationReject { session_id, request_timestamp, code, reason }
            }
            TemplateId::Establish => {
                let timestamp = block.try_get_u64_le()?;
                let keepalive_millis = block.try_get_u32_le()?;
                let next_seq_no = block.try_get_u64_le()?;
                SessionMessage::Establish { session_id, timestamp, keepalive_millis, next_seq_no }
            }
            TemplateId::EstablishmentAck => {
                let request_timestamp = block.try_get_u64_le()?;
                let keepalive_millis = block.try_get_u32_le()?;
                let next_seq_no = block.try_get_u64_le()?;
                SessionMessage::EstablishmentAck { session_id, request_timestamp, keepalive_millis, next_seq_no }
            }
            TemplateId::EstablishmentReject => {
                let request_timestamp = block.try_get_u64_le()?;
                let code = TerminationCode::try_from(block.try_get_u8()?)?;
                let reason = try_get_optional_string(buf)?;
                SessionMessage::EstablishmentReject { session_id, request_timestamp, code, reason }
            }
            TemplateId::Sequence => {
                let next_seq_no = block.try_get_u64_le()?;
                SessionMessage::Sequence { session_id, next_seq_no }
            }
            TemplateId::Terminate => {
                let code = TerminationCode::try_from(block.try_get_u8()?)?;
                let reason = try_get_optional_string(buf)?;
                SessionMessage::Terminate { session_id, code, reason }
            }
            TemplateId::RetransmitRequest => {
                let timestamp = block.try_get_u64_le()?;
                let from_seq_no = block.try_get_u64_le()?;
                let count = block.try_get_u32_le()?;
                SessionMessage::RetransmitRequest { session_id, timestamp, from_seq_no, count }
            }
            TemplateId::Retransmission => {
                let request_timestamp = block.try_get_u64_le()?;
                let next_seq_no = block.try_get_u64_le()?;
                let count = block.try_get_u32_le()?;
                SessionMessage::Retransmission { session_id, request_timestamp, next_seq_no, count }
            }
            TemplateId::NotApplied => {
                let from_seq_no = block.try_get_u64_le()?;
                let count = block.try_get_u32_le()?;
                SessionMessage::NotApplied { session_id, from_seq_no, count }
            }
            TemplateId::UnsequencedHeartbeat => {
                SessionMessage::UnsequencedHeartbeat { session_id }
            }
        };
        Ok(result)
    }
}

/// A decoded frame body
#[derive(Debug, Eq, PartialEq)]
pub enum Frame<'a> {
    Session(SessionMessage),
    /// the complete frame body including the application's message header
    Application(&'a [u8]),
}

pub fn decode_frame(body: &[u8]) -> anyhow::Result<Frame<'_>> {
    let mut buf = body;
    let header = MessageHeader::deser(&mut buf)?;
    if header.schema_id != SESSION_SCHEMA_ID {
        return Ok(Frame::Application(body));
    }
    Ok(Frame::Session(SessionMessage::deser_body(&header, &mut buf)?))
}

/// Template and session id of a session message frame body without decoding the rest of the
///  message, or `None` for application messages and unparseable frames
pub fn peek_session_message(body: &[u8]) -> Option<(TemplateId, Uuid)> {
    let mut buf = body;
    let header = MessageHeader::deser(&mut buf).ok()?;
    if header.schema_id != SESSION_SCHEMA_ID {
        return None;
    }
    let template_id = TemplateId::try_from(header.template_id).ok()?;
    let session_id = try_get_uuid(&mut buf).ok()?;
    Some((template_id, session_id))
}
