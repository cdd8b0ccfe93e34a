//! Frame codec: one complete wire-encoded message per frame.
//!
//! Wire layout, all numbers network byte order (BE):
//! ```ascii
//! 0:  marker: 4 ASCII bytes "_RFS"
//! 4:  sequence number (u16, never 0)
//! 6:  reply-to (u16) - sequence number this frame answers, 0 for requests
//! 8:  type tag (u16) - see MessageTag; unknown tags are fatal
//! 10: body length (u32)
//! 14: body bytes
//! ```
//!
//! Reading goes through a [`FrameReader`] that accumulates inbound bytes in a
//! buffer and only consumes them once a complete frame is present. That makes
//! `read_frame` cancel safe: a read deadline firing mid-frame leaves the
//! partial bytes in the buffer instead of corrupting the stream. A clean EOF
//! at a frame boundary decodes to `None`; EOF mid-frame, a bad marker or an
//! unknown tag are fatal for the connection.

use anyhow::{bail, Context};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::message::{Message, MessageTag};

pub const MARKER: [u8; 4] = *b"_RFS";

const HEADER_LEN: usize = 14;

/// `reply_to` value marking a frame as a request.
pub const REQUEST: u16 = 0;

/// A decoded frame: correlation header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub seq: u16,
    /// Sequence number of the request this frame answers, [`REQUEST`] if none.
    pub reply_to: u16,
    pub msg: Message,
}

impl Envelope {
    pub fn request(seq: u16, msg: Message) -> Envelope {
        Envelope {
            seq,
            reply_to: REQUEST,
            msg,
        }
    }

    pub fn reply(seq: u16, reply_to: u16, msg: Message) -> Envelope {
        Envelope { seq, reply_to, msg }
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to != REQUEST
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    env: &Envelope,
) -> anyhow::Result<()> {
    let mut body = BytesMut::new();
    env.msg.ser_body(&mut body)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&MARKER);
    buf.put_u16(env.seq);
    buf.put_u16(env.reply_to);
    buf.put_u16(env.msg.tag().into());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    w.write_all(&buf).await?;
    Ok(())
}

/// Tries to parse one complete frame from the front of `buf`, consuming its
/// bytes only on success. `Ok(None)` means more bytes are needed; errors mean
/// the stream is corrupt.
fn parse_frame(buf: &mut BytesMut, max_body: usize) -> anyhow::Result<Option<Envelope>> {
    // Fail fast on a bad marker even before the header is complete
    let have = buf.len().min(4);
    if buf[..have] != MARKER[..have] {
        bail!("bad frame marker {:02x?} - stream is corrupt", &buf[..have]);
    }
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let raw_tag = u16::from_be_bytes([buf[8], buf[9]]);
    let tag = MessageTag::try_from(raw_tag)
        .map_err(|_| anyhow::anyhow!("unknown message tag {} - closing connection", raw_tag))?;
    let body_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;
    if body_len > max_body {
        bail!(
            "frame body of {} bytes exceeds the configured maximum of {}",
            body_len,
            max_body
        );
    }
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    let header = buf.split_to(HEADER_LEN);
    let seq = u16::from_be_bytes([header[4], header[5]]);
    let reply_to = u16::from_be_bytes([header[6], header[7]]);
    let mut body = buf.split_to(body_len).freeze();

    let msg = Message::deser_body(tag, &mut body).context("malformed frame body")?;
    Ok(Some(Envelope { seq, reply_to, msg }))
}

/// Incremental frame decoder over an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader {
            reader,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads exactly one frame. Returns `Ok(None)` on a clean EOF at a frame
    /// boundary; everything else that is not a complete, well-formed frame is
    /// an error and the connection should be closed.
    ///
    /// Cancel safe: dropping the future (e.g. when a read deadline fires)
    /// keeps any partially received frame buffered for the next call.
    pub async fn read_frame(&mut self, max_body: usize) -> anyhow::Result<Option<Envelope>> {
        loop {
            if let Some(env) = parse_frame(&mut self.buf, max_body)? {
                return Ok(Some(env));
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!(
                    "connection closed mid-frame with {} bytes pending",
                    self.buf.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    const MAX: usize = 16 * 1024 * 1024;

    async fn encode(env: &Envelope) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, env).await.unwrap();
        buf
    }

    async fn roundtrip(env: &Envelope) -> Envelope {
        let buf = encode(env).await;
        FrameReader::new(buf.as_slice())
            .read_frame(MAX)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let env = Envelope::request(
            42,
            Message::Open {
                path: "/tmp/a.txt".into(),
                mode: crate::protocol::message::OpenMode::Read,
                deflate: 0,
            },
        );
        assert_eq!(roundtrip(&env).await, env);

        let reply = Envelope::reply(
            43,
            42,
            Message::Ack {
                file_id: Some(1),
                code: crate::protocol::message::AckCode::Ok,
                value: 0,
                message: None,
            },
        );
        let decoded = roundtrip(&reply).await;
        assert!(decoded.is_reply());
        assert_eq!(decoded, reply);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_are_separated() {
        let first = Envelope::request(1, Message::Ping);
        let second = Envelope::request(2, Message::Close { file_id: 3 });
        let mut bytes = encode(&first).await;
        bytes.extend_from_slice(&encode(&second).await);

        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_frame(MAX).await.unwrap().unwrap(), first);
        assert_eq!(reader.read_frame(MAX).await.unwrap().unwrap(), second);
        assert!(reader.read_frame(MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_delivery_is_reassembled() {
        let env = Envelope::request(
            7,
            Message::Data {
                file_id: Some(1),
                has_next: true,
                deflate: 0,
                data: Bytes::from_static(b"0123456789"),
            },
        );
        let bytes = encode(&env).await;

        // Feed the frame into the parse buffer a byte at a time
        let mut buf = BytesMut::new();
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            let parsed = parse_frame(&mut buf, MAX).unwrap();
            if i + 1 < bytes.len() {
                assert!(parsed.is_none(), "complete frame after {} bytes", i + 1);
            } else {
                assert_eq!(parsed.unwrap(), env);
            }
        }
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let empty: &[u8] = &[];
        assert!(FrameReader::new(empty)
            .read_frame(MAX)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_fatal() {
        let mut bytes = encode(&Envelope::request(1, Message::Ping)).await;
        bytes.truncate(bytes.len() - 3);
        assert!(FrameReader::new(bytes.as_slice())
            .read_frame(MAX)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bad_marker_is_fatal() {
        let mut bytes = encode(&Envelope::request(1, Message::Ping)).await;
        bytes[0] = b'X';
        assert!(FrameReader::new(bytes.as_slice())
            .read_frame(MAX)
            .await
            .is_err());

        // Detected even before a full header arrives
        let mut buf = BytesMut::new();
        buf.put_slice(b"XY");
        assert!(parse_frame(&mut buf, MAX).is_err());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        let mut bytes = encode(&Envelope::request(1, Message::Ping)).await;
        // Overwrite the tag with a value outside the registry
        bytes[8] = 0xff;
        bytes[9] = 0xff;
        assert!(FrameReader::new(bytes.as_slice())
            .read_frame(MAX)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let env = Envelope::request(
            7,
            Message::Write {
                file_id: 1,
                deflate: 0,
                data: Bytes::from_static(&[0u8; 64]),
            },
        );
        let bytes = encode(&env).await;
        assert!(FrameReader::new(bytes.as_slice()).read_frame(16).await.is_err());
    }
}
