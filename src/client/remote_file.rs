//! Path-based metadata operations, patterned after a local file handle.
//!
//! A [`RemoteFile`] is just a path bound to a connection; it holds no
//! provider-side state, so instances are cheap and freely cloneable. Every
//! method is one request/reply round trip.

use anyhow::bail;

use crate::client::client::RemoteFsClient;
use crate::protocol::file_attrs::FileAttributes;
use crate::protocol::message::{FileAction, Message};

#[derive(Clone)]
pub struct RemoteFile {
    client: RemoteFsClient,
    path: String,
}

impl RemoteFile {
    pub(crate) fn new(client: RemoteFsClient, path: String) -> RemoteFile {
        RemoteFile { client, path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Snapshot of the file's metadata. For a missing path this succeeds and
    /// reports a non-existent entry, mirroring local stat-style APIs.
    pub async fn attributes(&self) -> anyhow::Result<FileAttributes> {
        match self
            .client
            .file_action(&self.path, FileAction::GetAttributes, -1, None)
            .await?
        {
            Message::FileAttrs { attrs } => Ok(attrs),
            other => bail!("unexpected attributes reply {:?}", other.tag()),
        }
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.exists())
    }

    pub async fn is_file(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.is_file())
    }

    pub async fn is_directory(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.is_directory())
    }

    pub async fn is_hidden(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.is_hidden())
    }

    pub async fn can_read(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.can_read())
    }

    pub async fn can_write(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.can_write())
    }

    pub async fn can_execute(&self) -> anyhow::Result<bool> {
        Ok(self.attributes().await?.can_execute())
    }

    pub async fn length(&self) -> anyhow::Result<u64> {
        Ok(self.attributes().await?.len)
    }

    /// Modification time in milliseconds since the epoch, `0` for a missing
    /// path.
    pub async fn last_modified(&self) -> anyhow::Result<i64> {
        Ok(self.attributes().await?.modified_millis)
    }

    /// Lists a directory. Missing or non-directory paths yield an empty list.
    pub async fn list(&self) -> anyhow::Result<Vec<FileAttributes>> {
        match self
            .client
            .file_action(&self.path, FileAction::ListFiles, -1, None)
            .await?
        {
            Message::FileList { entries } => Ok(entries),
            other => bail!("unexpected listing reply {:?}", other.tag()),
        }
    }

    /// Lists the provider's file system roots. The path is ignored.
    pub async fn list_roots(&self) -> anyhow::Result<Vec<FileAttributes>> {
        match self
            .client
            .file_action(&self.path, FileAction::ListRoots, -1, None)
            .await?
        {
            Message::FileList { entries } => Ok(entries),
            other => bail!("unexpected roots reply {:?}", other.tag()),
        }
    }

    /// Atomically creates the file if and only if it does not exist yet.
    /// Returns whether it was created.
    pub async fn create_new(&self) -> anyhow::Result<bool> {
        self.bool_action(FileAction::CreateNew, -1, None).await
    }

    /// Deletes the file or empty directory. `false` when nothing was deleted.
    pub async fn delete(&self) -> anyhow::Result<bool> {
        self.bool_action(FileAction::Delete, -1, None).await
    }

    pub async fn mkdir(&self) -> anyhow::Result<bool> {
        self.bool_action(FileAction::Mkdir, -1, None).await
    }

    /// Creates the directory including all missing parents.
    pub async fn mkdirs(&self) -> anyhow::Result<bool> {
        self.bool_action(FileAction::Mkdirs, -1, None).await
    }

    /// Renames to `target`, a provider-side path. Whether this works across
    /// file systems is up to the provider's platform.
    pub async fn rename_to(&self, target: &str) -> anyhow::Result<bool> {
        self.bool_action(FileAction::Rename, -1, Some(target.to_string()))
            .await
    }

    /// Sets the modification time, milliseconds since the epoch.
    pub async fn set_last_modified(&self, millis: i64) -> anyhow::Result<bool> {
        self.bool_action(FileAction::SetLastModified, millis, None)
            .await
    }

    pub async fn set_readable(&self, readable: bool) -> anyhow::Result<bool> {
        self.bool_action(FileAction::SetReadable, readable as i64, None)
            .await
    }

    pub async fn set_writable(&self, writable: bool) -> anyhow::Result<bool> {
        self.bool_action(FileAction::SetWritable, writable as i64, None)
            .await
    }

    pub async fn set_executable(&self, executable: bool) -> anyhow::Result<bool> {
        self.bool_action(FileAction::SetExecutable, executable as i64, None)
            .await
    }

    pub async fn set_read_only(&self) -> anyhow::Result<bool> {
        self.bool_action(FileAction::SetReadOnly, -1, None).await
    }

    /// Unallocated bytes on the partition holding this path.
    pub async fn free_space(&self) -> anyhow::Result<i64> {
        self.long_action(FileAction::FreeSpace, -1, None).await
    }

    pub async fn total_space(&self) -> anyhow::Result<i64> {
        self.long_action(FileAction::TotalSpace, -1, None).await
    }

    /// Bytes actually available to the provider process, quotas included.
    pub async fn usable_space(&self) -> anyhow::Result<i64> {
        self.long_action(FileAction::UsableSpace, -1, None).await
    }

    async fn bool_action(
        &self,
        action: FileAction,
        long_arg: i64,
        str_arg: Option<String>,
    ) -> anyhow::Result<bool> {
        Ok(self.long_action(action, long_arg, str_arg).await? != 0)
    }

    async fn long_action(
        &self,
        action: FileAction,
        long_arg: i64,
        str_arg: Option<String>,
    ) -> anyhow::Result<i64> {
        match self
            .client
            .file_action(&self.path, action, long_arg, str_arg)
            .await?
        {
            Message::FileLong { value } => Ok(value),
            Message::Ack { message, .. } => {
                bail!(
                    "{:?} on {} failed: {}",
                    action,
                    self.path,
                    message.unwrap_or_default()
                );
            }
            other => bail!("unexpected {:?} reply {:?}", action, other.tag()),
        }
    }
}
