use bytes::{Buf, BufMut, BytesMut};

/// The fixed SBE message header at the start of every frame body. All fields are little endian.
///
/// ```ascii
/// 0: block length (u16 LE) - length of the fixed-size part of the message body
/// 2: template id (u16 LE)
/// 4: schema id (u16 LE)
/// 6: schema version (u16 LE)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 4 * size_of::<u16>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.block_length);
        buf.put_u16_le(self.template_id);
        buf.put_u16_le(self.schema_id);
        buf.put_u16_le(self.version);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let block_length = buf.try_get_u16_le()?;
        let template_id = buf.try_get_u16_le()?;
        let schema_id = buf.try_get_u16_le()?;
        let version = buf.try_get_u16_le()?;
        Ok(MessageHeader {
            block_length,
            template_id,
            schema_id,
            version,
        })
    }
}
