use bytes::{Buf, BufMut, BytesMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

/// An absent string is written as an empty one
pub fn put_optional_string(buf: &mut BytesMut, s: Option<&str>) {
    put_string(buf, s.unwrap_or(""));
}

pub fn try_get_optional_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    let s = try_get_string(buf)?;
    if s.is_empty() {
        Ok(None)
    }
    else {
        Ok(Some(s))
    }
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        anyhow::bail!("buffer underflow: {} bytes announced, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    if buf.remaining() < 16 {
        anyhow::bail!("buffer underflow: session id needs 16 bytes, {} remaining", buf.remaining());
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("credentials rejected")]
    #[case::utf8("Grüße")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[test]
    fn test_optional_string_empty_is_absent() {
        let mut buf = BytesMut::new();
        put_optional_string(&mut buf, None);
        put_optional_string(&mut buf, Some("x"));

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_optional_string(&mut b).unwrap(), None);
        assert_eq!(try_get_optional_string(&mut b).unwrap(), Some("x".to_string()));
    }

    #[test]
    fn test_bytes_underflow() {
        let mut buf = BytesMut::new();
        buf.put_usize_varint(10);
        buf.put_slice(b"abc");

        let mut b: &[u8] = &buf;
        assert!(try_get_bytes(&mut b).is_err());
    }

    #[test]
    fn test_uuid_underflow() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(try_get_uuid(&mut b).is_err());
    }
}
