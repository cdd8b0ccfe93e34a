use std::path::Path;
use std::time::UNIX_EPOCH;

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::protocol::wire::{put_string, try_get_string};

bitflags! {
    /// Attribute bits transmitted alongside every directory entry.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct FileFlags: u8 {
        const IS_FILE = 1 << 0;
        const IS_DIRECTORY = 1 << 1;
        const IS_HIDDEN = 1 << 2;
        const CAN_READ = 1 << 3;
        const CAN_WRITE = 1 << 4;
        const CAN_EXECUTE = 1 << 5;
    }
}

/// Metadata snapshot of one file, as reported by the provider.
///
/// A path that does not exist yields a snapshot with zero length, zero
/// modification time and no flags set - callers test `exists()` instead of
/// getting an error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileAttributes {
    pub name: String,
    pub len: u64,
    /// Milliseconds since the Unix epoch, `0` if unknown.
    pub modified_millis: i64,
    pub flags: FileFlags,
}

impl FileAttributes {
    pub fn from_path(path: &Path) -> FileAttributes {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            // Happens for roots like "/"
            None => path.to_string_lossy().into_owned(),
        };

        let mut flags = FileFlags::empty();
        let (len, modified_millis) = match std::fs::metadata(path) {
            Ok(meta) => {
                if meta.is_file() {
                    flags |= FileFlags::IS_FILE;
                }
                if meta.is_dir() {
                    flags |= FileFlags::IS_DIRECTORY;
                }
                if name.starts_with('.') {
                    flags |= FileFlags::IS_HIDDEN;
                }
                flags |= access_flags(path, &meta);

                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                (meta.len(), modified)
            }
            Err(_) => (0, 0),
        };

        FileAttributes {
            name,
            len,
            modified_millis,
            flags,
        }
    }

    pub fn exists(&self) -> bool {
        self.flags
            .intersects(FileFlags::IS_FILE | FileFlags::IS_DIRECTORY)
    }

    pub fn is_file(&self) -> bool {
        self.flags.contains(FileFlags::IS_FILE)
    }

    pub fn is_directory(&self) -> bool {
        self.flags.contains(FileFlags::IS_DIRECTORY)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(FileFlags::IS_HIDDEN)
    }

    pub fn can_read(&self) -> bool {
        self.flags.contains(FileFlags::CAN_READ)
    }

    pub fn can_write(&self) -> bool {
        self.flags.contains(FileFlags::CAN_WRITE)
    }

    pub fn can_execute(&self) -> bool {
        self.flags.contains(FileFlags::CAN_EXECUTE)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_string(buf, &self.name)?;
        buf.put_u64(self.len);
        buf.put_i64(self.modified_millis);
        buf.put_u8(self.flags.bits());
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FileAttributes> {
        let name = try_get_string(buf)?;
        let len = buf.try_get_u64()?;
        let modified_millis = buf.try_get_i64()?;
        let flags = FileFlags::from_bits_truncate(buf.try_get_u8()?);
        Ok(FileAttributes {
            name,
            len,
            modified_millis,
            flags,
        })
    }
}

#[cfg(unix)]
fn access_flags(_path: &Path, meta: &std::fs::Metadata) -> FileFlags {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode();
    let mut flags = FileFlags::empty();
    if mode & 0o400 != 0 {
        flags |= FileFlags::CAN_READ;
    }
    if mode & 0o200 != 0 {
        flags |= FileFlags::CAN_WRITE;
    }
    if mode & 0o100 != 0 {
        flags |= FileFlags::CAN_EXECUTE;
    }
    flags
}

#[cfg(not(unix))]
fn access_flags(_path: &Path, meta: &std::fs::Metadata) -> FileFlags {
    let mut flags = FileFlags::CAN_READ;
    if !meta.permissions().readonly() {
        flags |= FileFlags::CAN_WRITE;
    }
    flags
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_attrs_roundtrip() {
        let attrs = FileAttributes {
            name: "report.txt".to_string(),
            len: 4096,
            modified_millis: 1_700_000_000_123,
            flags: FileFlags::IS_FILE | FileFlags::CAN_READ | FileFlags::CAN_WRITE,
        };
        let mut buf = BytesMut::new();
        attrs.ser(&mut buf).unwrap();
        let actual = FileAttributes::deser(&mut buf.freeze()).unwrap();
        assert_eq!(actual, attrs);
        assert!(actual.is_file());
        assert!(!actual.is_directory());
        assert!(actual.can_write());
    }

    #[test]
    fn test_missing_path_has_no_flags() {
        let attrs = FileAttributes::from_path(Path::new("/definitely/not/there/xyz"));
        assert!(!attrs.exists());
        assert_eq!(attrs.len, 0);
        assert_eq!(attrs.modified_millis, 0);
    }
}
