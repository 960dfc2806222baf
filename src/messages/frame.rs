use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Simple Open Framing Header: every frame on the wire starts with it.
///
/// ```ascii
/// 0: frame length (u32 BE) - including these 6 header bytes
/// 4: encoding type (u16 BE)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_len: u32,
    pub encoding: u16,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + size_of::<u16>();

    /// SBE version 1.0, little endian
    pub const SBE_LITTLE_ENDIAN: u16 = 0x5BE0;

    /// The largest body that fits into a frame
    pub const MAX_BODY_LEN: usize = u32::MAX as usize - Self::SERIALIZED_LEN;

    /// NB: `body_len` must not exceed [FrameHeader::MAX_BODY_LEN]
    pub fn for_body(body_len: usize) -> FrameHeader {
        FrameHeader {
            frame_len: (body_len + Self::SERIALIZED_LEN).prechecked_cast(),
            encoding: Self::SBE_LITTLE_ENDIAN,
        }
    }

    pub fn body_len(&self) -> usize {
        let frame_len: usize = self.frame_len.safe_cast();
        frame_len - Self::SERIALIZED_LEN
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.frame_len);
        buf.put_u16(self.encoding);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let frame_len = buf.try_get_u32()?;
        let encoding = buf.try_get_u16()?;

        let frame_len_usize: usize = frame_len.safe_cast();
        if frame_len_usize < Self::SERIALIZED_LEN {
            bail!("frame length {} is shorter than the frame header", frame_len);
        }
        Ok(FrameHeader {
            frame_len,
            encoding,
        })
    }
}

/// Writes a frame header for `body`, followed by `body` itself
pub fn put_frame(buf: &mut BytesMut, body: &[u8]) {
    FrameHeader::for_body(body.len()).ser(buf);
    buf.put_slice(body);
}

/// Splits a buffer of one or more concatenated frames into frame bodies (or complete frames). A
///  truncated frame is reported as an error, after which iteration stops.
pub struct FrameSplitter<'a> {
    buf: &'a [u8],
    include_header: bool,
}

impl<'a> FrameSplitter<'a> {
    /// iterates over frame bodies
    pub fn new(buf: &'a [u8]) -> FrameSplitter<'a> {
        FrameSplitter { buf, include_header: false }
    }

    /// iterates over complete frames, i.e. including the frame header
    pub fn frames(buf: &'a [u8]) -> FrameSplitter<'a> {
        FrameSplitter { buf, include_header: true }
    }
}

impl<'a> Iterator for FrameSplitter<'a> {
    type Item = anyhow::Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let mut parse_buf = self.buf;
        let header = match FrameHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                self.buf = &[];
                return Some(Err(e));
            }
        };

        if header.encoding != FrameHeader::SBE_LITTLE_ENDIAN {
            self.buf = &[];
            return Some(Err(anyhow::anyhow!("unsupported frame encoding {:#06x}", header.encoding)));
        }

        let body_len = header.body_len();
        if parse_buf.len() < body_len {
            let remaining = parse_buf.len();
            self.buf = &[];
            return Some(Err(anyhow::anyhow!("truncated frame: {} body bytes announced, {} available", body_len, remaining)));
        }

        let (frame, rest) = self.buf.split_at(FrameHeader::SERIALIZED_LEN + body_len);
        self.buf = rest;
        if self.include_header {
            Some(Ok(frame))
        }
        else {
            Some(Ok(&frame[FrameHeader::SERIALIZED_LEN..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        FrameHeader::for_body(10).ser(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 16, 0x5B, 0xE0]);
    }

    #[test]
    fn test_header_too_short() {
        let mut b: &[u8] = &[0, 0, 0, 5, 0x5B, 0xE0];
        assert!(FrameHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::single(vec![b"abc".to_vec()])]
    #[case::empty_body(vec![vec![]])]
    #[case::several(vec![b"a".to_vec(), b"bcdef".to_vec(), vec![], b"xyz".to_vec()])]
    fn test_splitter(#[case] bodies: Vec<Vec<u8>>) {
        let mut buf = BytesMut::new();
        for body in &bodies {
            put_frame(&mut buf, body);
        }

        let split = FrameSplitter::new(&buf)
            .map(|f| f.unwrap().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(split, bodies);
    }

    #[test]
    fn test_splitter_complete_frames() {
        let mut first = BytesMut::new();
        put_frame(&mut first, b"a");
        let mut second = BytesMut::new();
        put_frame(&mut second, b"bc");

        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let split = FrameSplitter::frames(&buf)
            .map(|f| f.unwrap().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(split, vec![first.to_vec(), second.to_vec()]);
    }

    #[test]
    fn test_splitter_truncated() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"complete");
        put_frame(&mut buf, b"truncated");
        buf.truncate(buf.len() - 2);

        let mut splitter = FrameSplitter::new(&buf);
        assert_eq!(splitter.next().unwrap().unwrap(), b"complete");
        assert!(splitter.next().unwrap().is_err());
        assert!(splitter.next().is_none());
    }

    #[test]
    fn test_splitter_wrong_encoding() {
        let buf = [0u8, 0, 0, 7, 0x12, 0x34, 99];
        let mut splitter = FrameSplitter::new(&buf);
        assert!(splitter.next().unwrap().is_err());
        assert!(splitter.next().is_none());
    }
}
