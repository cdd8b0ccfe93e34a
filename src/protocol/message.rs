//! The closed set of payload types, keyed by a numeric wire tag.
//!
//! Every variant knows how to serialize its body into a buffer and how to
//! deserialize it back given the tag from the frame header. An unknown tag is
//! a framing error and kills the connection - the tag space is versioned, not
//! open-ended.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::file_attrs::FileAttributes;
use crate::protocol::wire::{
    put_blob, put_opt_file_id, put_opt_string, put_string, try_get_blob, try_get_opt_file_id,
    try_get_opt_string, try_get_string,
};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum MessageTag {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    StreamAction = 5,
    Flush = 6,
    Data = 7,
    Ack = 8,
    Ping = 9,
    Fetch = 10,
    Put = 11,
    FileAction = 12,
    FileLong = 13,
    FileAttrs = 14,
    FileList = 15,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpenMode {
    Read = b'r',
    Write = b'w',
}

/// Status of an [`Message::Ack`] reply.
///
/// `Warn` is an operation-specific soft failure ("file not found"): the caller
/// treats it as a negative result, the connection stays up. `Err` is a hard
/// failure; the affected handle should be considered unusable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckCode {
    Ok = 0,
    Warn = 1,
    Err = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamAction {
    Available = 0,
    Skip = 1,
    MarkSupported = 2,
    Mark = 3,
    Reset = 4,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileAction {
    GetAttributes = 0,
    ListFiles = 1,
    ListRoots = 2,
    CreateNew = 3,
    Delete = 4,
    Mkdir = 5,
    Mkdirs = 6,
    Rename = 7,
    SetLastModified = 8,
    SetReadable = 9,
    SetWritable = 10,
    SetExecutable = 11,
    SetReadOnly = 12,
    FreeSpace = 13,
    TotalSpace = 14,
    UsableSpace = 15,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Open a provider-side file, returning a fresh file id in the Ack.
    Open {
        path: String,
        mode: OpenMode,
        /// Requested deflate level for chunk transfer, `0` = off.
        deflate: u8,
    },
    /// Release a file handle. The provider sends no reply; closing an unknown
    /// or already-closed handle is a no-op.
    Close { file_id: u16 },
    /// Read up to `len` bytes from an open read handle. Answered with `Data`.
    Read { file_id: u16, len: u32 },
    /// Append bytes to an open write handle. `deflate > 0` means the payload
    /// is compressed and must be inflated before writing.
    Write {
        file_id: u16,
        deflate: u8,
        data: Bytes,
    },
    /// Positioning/introspection action on an open read handle. `value` is
    /// the argument for `Skip` and `Mark`, ignored otherwise.
    StreamAction {
        file_id: u16,
        action: StreamAction,
        value: i64,
    },
    /// Flush an open write handle to disk.
    Flush { file_id: u16 },
    /// One chunk of a bulk transfer. `file_id` is absent for fetch replies,
    /// present for put chunks. The last chunk carries `has_next = false`.
    Data {
        file_id: Option<u16>,
        has_next: bool,
        /// Deflate level the payload was compressed with, `0` = stored as-is.
        deflate: u8,
        data: Bytes,
    },
    /// Generic acknowledgement. `value` carries operation results such as the
    /// byte count of a `Skip`; `message` explains `Warn`/`Err` codes.
    Ack {
        file_id: Option<u16>,
        code: AckCode,
        value: i64,
        message: Option<String>,
    },
    /// Liveness probe. Sent as a request by an idle provider, answered by the
    /// client with a `Ping` reply carrying the request's sequence number.
    Ping,
    /// Bulk-download a whole file as a stream of `Data` chunks of at most
    /// `mtu` payload bytes each.
    Fetch { path: String, deflate: u8, mtu: u32 },
    /// Bulk-upload announcement; the Ack returns the file id the subsequent
    /// `Data` chunks must carry.
    Put { path: String, deflate: u8 },
    /// One-shot metadata/path operation. `long_arg` and `str_arg` are the
    /// action-specific parameters (rename target, mtime, flag value).
    FileAction {
        path: String,
        action: FileAction,
        long_arg: i64,
        str_arg: Option<String>,
    },
    /// Reply for actions returning a number (booleans are `1`/`0`).
    FileLong { value: i64 },
    /// Reply for `GetAttributes`.
    FileAttrs { attrs: FileAttributes },
    /// Reply for `ListFiles` / `ListRoots`.
    FileList { entries: Vec<FileAttributes> },
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Open { .. } => MessageTag::Open,
            Message::Close { .. } => MessageTag::Close,
            Message::Read { .. } => MessageTag::Read,
            Message::Write { .. } => MessageTag::Write,
            Message::StreamAction { .. } => MessageTag::StreamAction,
            Message::Flush { .. } => MessageTag::Flush,
            Message::Data { .. } => MessageTag::Data,
            Message::Ack { .. } => MessageTag::Ack,
            Message::Ping => MessageTag::Ping,
            Message::Fetch { .. } => MessageTag::Fetch,
            Message::Put { .. } => MessageTag::Put,
            Message::FileAction { .. } => MessageTag::FileAction,
            Message::FileLong { .. } => MessageTag::FileLong,
            Message::FileAttrs { .. } => MessageTag::FileAttrs,
            Message::FileList { .. } => MessageTag::FileList,
        }
    }

    /// The file handle this message refers to, if any. Used by the client's
    /// reader task to route spontaneous provider messages.
    pub fn file_id(&self) -> Option<u16> {
        match self {
            Message::Close { file_id }
            | Message::Read { file_id, .. }
            | Message::Write { file_id, .. }
            | Message::StreamAction { file_id, .. }
            | Message::Flush { file_id } => Some(*file_id),
            Message::Data { file_id, .. } | Message::Ack { file_id, .. } => *file_id,
            _ => None,
        }
    }

    pub fn ser_body(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            Message::Open {
                path,
                mode,
                deflate,
            } => {
                put_string(buf, path)?;
                buf.put_u8((*mode).into());
                buf.put_u8(*deflate);
            }
            Message::Close { file_id } => {
                buf.put_u16(*file_id);
            }
            Message::Read { file_id, len } => {
                buf.put_u16(*file_id);
                buf.put_u32(*len);
            }
            Message::Write {
                file_id,
                deflate,
                data,
            } => {
                buf.put_u16(*file_id);
                buf.put_u8(*deflate);
                put_blob(buf, data);
            }
            Message::StreamAction {
                file_id,
                action,
                value,
            } => {
                buf.put_u16(*file_id);
                buf.put_u8((*action).into());
                buf.put_i64(*value);
            }
            Message::Flush { file_id } => {
                buf.put_u16(*file_id);
            }
            Message::Data {
                file_id,
                has_next,
                deflate,
                data,
            } => {
                put_opt_file_id(buf, *file_id);
                buf.put_u8(*has_next as u8);
                buf.put_u8(*deflate);
                put_blob(buf, data);
            }
            Message::Ack {
                file_id,
                code,
                value,
                message,
            } => {
                put_opt_file_id(buf, *file_id);
                buf.put_u8((*code).into());
                buf.put_i64(*value);
                put_opt_string(buf, message.as_deref())?;
            }
            Message::Ping => {}
            Message::Fetch { path, deflate, mtu } => {
                put_string(buf, path)?;
                buf.put_u8(*deflate);
                buf.put_u32(*mtu);
            }
            Message::Put { path, deflate } => {
                put_string(buf, path)?;
                buf.put_u8(*deflate);
            }
            Message::FileAction {
                path,
                action,
                long_arg,
                str_arg,
            } => {
                put_string(buf, path)?;
                buf.put_u8((*action).into());
                buf.put_i64(*long_arg);
                put_opt_string(buf, str_arg.as_deref())?;
            }
            Message::FileLong { value } => {
                buf.put_i64(*value);
            }
            Message::FileAttrs { attrs } => {
                attrs.ser(buf)?;
            }
            Message::FileList { entries } => {
                buf.put_u32(entries.len() as u32);
                for e in entries {
                    e.ser(buf)?;
                }
            }
        }
        Ok(())
    }

    pub fn deser_body(tag: MessageTag, buf: &mut impl Buf) -> anyhow::Result<Message> {
        let msg = match tag {
            MessageTag::Open => Message::Open {
                path: try_get_string(buf)?,
                mode: OpenMode::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("invalid open mode: {}", e))?,
                deflate: buf.try_get_u8()?,
            },
            MessageTag::Close => Message::Close {
                file_id: buf.try_get_u16()?,
            },
            MessageTag::Read => Message::Read {
                file_id: buf.try_get_u16()?,
                len: buf.try_get_u32()?,
            },
            MessageTag::Write => Message::Write {
                file_id: buf.try_get_u16()?,
                deflate: buf.try_get_u8()?,
                data: try_get_blob(buf)?,
            },
            MessageTag::StreamAction => Message::StreamAction {
                file_id: buf.try_get_u16()?,
                action: StreamAction::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("invalid stream action: {}", e))?,
                value: buf.try_get_i64()?,
            },
            MessageTag::Flush => Message::Flush {
                file_id: buf.try_get_u16()?,
            },
            MessageTag::Data => Message::Data {
                file_id: try_get_opt_file_id(buf)?,
                has_next: buf.try_get_u8()? != 0,
                deflate: buf.try_get_u8()?,
                data: try_get_blob(buf)?,
            },
            MessageTag::Ack => Message::Ack {
                file_id: try_get_opt_file_id(buf)?,
                code: AckCode::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("invalid ack code: {}", e))?,
                value: buf.try_get_i64()?,
                message: try_get_opt_string(buf)?,
            },
            MessageTag::Ping => Message::Ping,
            MessageTag::Fetch => Message::Fetch {
                path: try_get_string(buf)?,
                deflate: buf.try_get_u8()?,
                mtu: buf.try_get_u32()?,
            },
            MessageTag::Put => Message::Put {
                path: try_get_string(buf)?,
                deflate: buf.try_get_u8()?,
            },
            MessageTag::FileAction => Message::FileAction {
                path: try_get_string(buf)?,
                action: FileAction::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("invalid file action: {}", e))?,
                long_arg: buf.try_get_i64()?,
                str_arg: try_get_opt_string(buf)?,
            },
            MessageTag::FileLong => Message::FileLong {
                value: buf.try_get_i64()?,
            },
            MessageTag::FileAttrs => Message::FileAttrs {
                attrs: FileAttributes::deser(buf)?,
            },
            MessageTag::FileList => {
                let count = buf.try_get_u32()? as usize;
                if count > 1_000_000 {
                    bail!("implausible directory listing of {} entries", count);
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(FileAttributes::deser(buf)?);
                }
                Message::FileList { entries }
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::protocol::file_attrs::FileFlags;

    use super::*;

    fn attrs(name: &str) -> FileAttributes {
        FileAttributes {
            name: name.to_string(),
            len: 123,
            modified_millis: 1_699_999_999_000,
            flags: FileFlags::IS_FILE | FileFlags::CAN_READ,
        }
    }

    #[rstest]
    #[case::open(Message::Open { path: "/tmp/a.txt".into(), mode: OpenMode::Read, deflate: 3 })]
    #[case::open_write(Message::Open { path: "/tmp/out".into(), mode: OpenMode::Write, deflate: 0 })]
    #[case::close(Message::Close { file_id: 7 })]
    #[case::read(Message::Read { file_id: 2, len: 8192 })]
    #[case::write(Message::Write { file_id: 3, deflate: 6, data: Bytes::from_static(b"abc") })]
    #[case::write_empty(Message::Write { file_id: 3, deflate: 0, data: Bytes::new() })]
    #[case::action(Message::StreamAction { file_id: 1, action: StreamAction::Skip, value: 1024 })]
    #[case::flush(Message::Flush { file_id: 9 })]
    #[case::data(Message::Data { file_id: Some(4), has_next: true, deflate: 9, data: Bytes::from_static(b"zzz") })]
    #[case::data_anonymous(Message::Data { file_id: None, has_next: false, deflate: 0, data: Bytes::new() })]
    #[case::ack_ok(Message::Ack { file_id: Some(5), code: AckCode::Ok, value: 0, message: None })]
    #[case::ack_empty_msg(Message::Ack { file_id: Some(5), code: AckCode::Ok, value: 17, message: Some("".into()) })]
    #[case::ack_warn(Message::Ack { file_id: None, code: AckCode::Warn, value: -1, message: Some("file not found".into()) })]
    #[case::ping(Message::Ping)]
    #[case::fetch(Message::Fetch { path: "/data/big.bin".into(), deflate: 5, mtu: 4096 })]
    #[case::put(Message::Put { path: "/data/in.bin".into(), deflate: 0 })]
    #[case::file_action(Message::FileAction { path: "/a".into(), action: FileAction::Rename, long_arg: -1, str_arg: Some("/b".into()) })]
    #[case::file_action_plain(Message::FileAction { path: "/a".into(), action: FileAction::Delete, long_arg: -1, str_arg: None })]
    #[case::file_long(Message::FileLong { value: i64::MIN })]
    #[case::file_attrs(Message::FileAttrs { attrs: attrs("x.bin") })]
    #[case::file_list(Message::FileList { entries: vec![attrs("a"), attrs("b")] })]
    #[case::file_list_empty(Message::FileList { entries: vec![] })]
    fn test_body_roundtrip(#[case] msg: Message) {
        let mut buf = BytesMut::new();
        msg.ser_body(&mut buf).unwrap();
        let actual = Message::deser_body(msg.tag(), &mut buf.freeze()).unwrap();
        assert_eq!(actual, msg);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(MessageTag::try_from(0xbeef_u16).is_err());
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let msg = Message::Read {
            file_id: 1,
            len: 10,
        };
        let mut buf = BytesMut::new();
        msg.ser_body(&mut buf).unwrap();
        let mut truncated = buf.freeze().slice(0..3);
        assert!(Message::deser_body(MessageTag::Read, &mut truncated).is_err());
    }
}
