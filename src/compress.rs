//! Per-chunk DEFLATE helpers for bulk transfer and write payloads.
//!
//! Compression is opportunistic: a chunk is only sent compressed if that
//! actually shrinks it, otherwise the original bytes go out with the deflate
//! level cleared to `0`.

use std::io::{Read, Write};

use anyhow::Context;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Highest accepted deflate level.
pub const MAX_DEFLATE: u8 = 9;

pub fn deflate(data: &[u8], level: u8) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(MAX_DEFLATE) as u32));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Compresses `data` if a level is requested and it pays off. Returns the
/// payload to put on the wire and the effective deflate level (`0` when the
/// original bytes are sent).
pub fn deflate_opportunistic(data: &[u8], level: u8) -> anyhow::Result<(Vec<u8>, u8)> {
    if level == 0 {
        return Ok((data.to_vec(), 0));
    }
    let compressed = deflate(data, level)?;
    if compressed.len() < data.len() {
        Ok((compressed, level))
    } else {
        Ok((data.to_vec(), 0))
    }
}

pub fn inflate(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("cannot inflate chunk")?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::level_1(1)]
    #[case::level_6(6)]
    #[case::level_9(9)]
    fn test_deflate_roundtrip(#[case] level: u8) {
        let data = b"compressible compressible compressible compressible".repeat(8);
        let (payload, effective) = deflate_opportunistic(&data, level).unwrap();
        assert_eq!(effective, level);
        assert!(payload.len() < data.len());
        assert_eq!(inflate(&payload).unwrap(), data);
    }

    #[test]
    fn test_incompressible_chunk_is_sent_raw() {
        // zlib output of random-ish short input is bigger than the input
        let data: Vec<u8> = (0..64).map(|i| (i * 37 + 11) as u8).collect();
        let (payload, effective) = deflate_opportunistic(&data, 9).unwrap();
        assert_eq!(effective, 0);
        assert_eq!(payload, data);
    }

    #[test]
    fn test_level_zero_is_passthrough() {
        let data = b"whatever".to_vec();
        let (payload, effective) = deflate_opportunistic(&data, 0).unwrap();
        assert_eq!(effective, 0);
        assert_eq!(payload, data);
    }

    #[test]
    fn test_inflate_garbage_is_an_error() {
        assert!(inflate(b"this is not a zlib stream").is_err());
    }

    #[test]
    fn test_empty_chunk() {
        let (payload, effective) = deflate_opportunistic(b"", 6).unwrap();
        assert_eq!(effective, 0);
        assert!(payload.is_empty());
    }
}
