//! Length-prefixed primitives shared by all message bodies.
//!
//! Strings carry a `u16` length prefix. The value `0xFFFF` is reserved as the
//! `null` sentinel, so an absent string and an empty string are distinct on
//! the wire - and a string long enough to collide with the sentinel cannot be
//! encoded at all. Byte blobs carry a `u32` length prefix and are always
//! present.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Length prefix marking a `null` string.
pub const NULL_STRING: u16 = u16::MAX;

/// Sentinel for "no file id" in messages where the handle is optional.
pub const NO_FILE_ID: u16 = u16::MAX;

pub fn put_string(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    if s.len() >= NULL_STRING as usize {
        bail!("string of {} bytes exceeds the wire limit", s.len());
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) -> anyhow::Result<()> {
    match s {
        Some(s) => put_string(buf, s),
        None => {
            buf.put_u16(NULL_STRING);
            Ok(())
        }
    }
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    match try_get_opt_string(buf)? {
        Some(s) => Ok(s),
        None => bail!("null string where a value is required"),
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    let len = buf.try_get_u16()?;
    if len == NULL_STRING {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        bail!("buffer underflow reading string of {} bytes", len);
    }
    let raw = buf.copy_to_bytes(len);
    Ok(Some(String::from_utf8(raw.to_vec())?))
}

pub fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn try_get_blob(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len {
        bail!("buffer underflow reading blob of {} bytes", len);
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_opt_file_id(buf: &mut BytesMut, file_id: Option<u16>) {
    buf.put_u16(file_id.unwrap_or(NO_FILE_ID));
}

pub fn try_get_opt_file_id(buf: &mut impl Buf) -> anyhow::Result<Option<u16>> {
    let raw = buf.try_get_u16()?;
    Ok(if raw == NO_FILE_ID { None } else { Some(raw) })
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(Some(""))]
    #[case::null(None)]
    #[case::plain(Some("/tmp/a.txt"))]
    #[case::unicode(Some("déjà vu"))]
    fn test_opt_string_roundtrip(#[case] s: Option<&str>) {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, s).unwrap();
        let actual = try_get_opt_string(&mut buf.freeze()).unwrap();
        assert_eq!(actual.as_deref(), s);
    }

    #[test]
    fn test_string_rejects_null() {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, None).unwrap();
        assert!(try_get_string(&mut buf.freeze()).is_err());
    }

    #[rstest]
    #[case::sentinel_collision(NULL_STRING as usize)]
    #[case::oversized(80_000)]
    fn test_string_too_long_for_the_prefix_is_rejected(#[case] len: usize) {
        let huge = "x".repeat(len);
        let mut buf = BytesMut::new();
        assert!(put_string(&mut buf, &huge).is_err());
        assert!(put_opt_string(&mut buf, Some(&huge)).is_err());
        // Nothing was written, the frame stays clean
        assert!(buf.is_empty());
    }

    #[test]
    fn test_longest_encodable_string_roundtrips() {
        let s = "y".repeat(NULL_STRING as usize - 1);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &s).unwrap();
        assert_eq!(try_get_string(&mut buf.freeze()).unwrap(), s);
    }

    #[test]
    fn test_truncated_string_is_an_error() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello").unwrap();
        let mut truncated = buf.freeze().slice(0..4);
        assert!(try_get_opt_string(&mut truncated).is_err());
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, b"\x00\x01\x02");
        let actual = try_get_blob(&mut buf.freeze()).unwrap();
        assert_eq!(&actual[..], b"\x00\x01\x02");
    }
}
