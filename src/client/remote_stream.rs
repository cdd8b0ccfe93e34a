//! Stream handles over an open provider-side file.
//!
//! A [`RemoteReader`] / [`RemoteWriter`] pairs a file id with the connection
//! it was opened on. All operations are strictly sequential per handle; the
//! handles keep per-stream transfer statistics so callers can see what
//! compression and the network actually did.

use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::client::RemoteFsClient;
use crate::compress::{deflate_opportunistic, inflate};
use crate::protocol::message::{Message, StreamAction};

/// Per-stream transfer counters.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Bytes seen by the application (after inflate / before deflate).
    pub io_bytes: u64,
    /// Bytes that actually crossed the wire as chunk payloads.
    pub wire_bytes: u64,
    /// Total time spent waiting on the provider.
    pub wait: Duration,
}

impl StreamStats {
    /// Wire bytes per application byte; `1.0` means compression did nothing.
    pub fn compression_ratio(&self) -> f64 {
        if self.io_bytes == 0 {
            return 1.0;
        }
        self.wire_bytes as f64 / self.io_bytes as f64
    }
}

/// Sequential reader over a remote file.
pub struct RemoteReader {
    client: RemoteFsClient,
    path: String,
    file_id: u16,
    stats: StreamStats,
    closed: bool,
}

impl RemoteReader {
    pub(crate) fn new(client: RemoteFsClient, path: String, file_id: u16) -> RemoteReader {
        RemoteReader {
            client,
            path,
            file_id,
            stats: StreamStats::default(),
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Reads up to `len` bytes from the current position. Returns `None` at
    /// end of file.
    pub async fn read(&mut self, len: u32) -> anyhow::Result<Option<Bytes>> {
        self.ensure_open()?;
        let started = Instant::now();
        let reply = self
            .client
            .request(Message::Read {
                file_id: self.file_id,
                len,
            })
            .await?;
        self.stats.wait += started.elapsed();

        match reply {
            Message::Data { deflate, data, .. } => {
                if data.is_empty() && len > 0 {
                    return Ok(None);
                }
                self.stats.wire_bytes += data.len() as u64;
                let chunk = if deflate > 0 {
                    Bytes::from(inflate(&data)?)
                } else {
                    data
                };
                self.stats.io_bytes += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Message::Ack { message, .. } => {
                bail!(
                    "read from {} failed: {}",
                    self.path,
                    message.unwrap_or_default()
                );
            }
            other => bail!("unexpected read reply {:?}", other.tag()),
        }
    }

    /// Bytes between the current position and end of file.
    pub async fn available(&mut self) -> anyhow::Result<i64> {
        self.action(StreamAction::Available, 0).await
    }

    /// Skips forward by at most `n` bytes, returning how far it actually got.
    pub async fn skip(&mut self, n: i64) -> anyhow::Result<i64> {
        self.action(StreamAction::Skip, n).await
    }

    pub async fn mark_supported(&mut self) -> anyhow::Result<bool> {
        Ok(self.action(StreamAction::MarkSupported, 0).await? != 0)
    }

    /// Remembers the current position for a later [`reset`](Self::reset).
    pub async fn mark(&mut self) -> anyhow::Result<()> {
        self.action(StreamAction::Mark, 0).await?;
        Ok(())
    }

    /// Rewinds to the last [`mark`](Self::mark). Fails if none was set.
    pub async fn reset(&mut self) -> anyhow::Result<()> {
        self.action(StreamAction::Reset, 0).await?;
        Ok(())
    }

    async fn action(&mut self, action: StreamAction, value: i64) -> anyhow::Result<i64> {
        self.ensure_open()?;
        let started = Instant::now();
        let (_, _, result, _) = self
            .client
            .request_ack(Message::StreamAction {
                file_id: self.file_id,
                action,
                value,
            })
            .await?;
        self.stats.wait += started.elapsed();
        Ok(result)
    }

    /// Releases the provider-side handle. Fire and forget, no reply expected;
    /// closing twice is a no-op.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        close_stream(&self.client, &mut self.closed, self.file_id, &self.path).await
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed {
            bail!("remote stream for {} is closed", self.path);
        }
        Ok(())
    }
}

impl Drop for RemoteReader {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "remote reader for {} dropped without close, provider keeps the handle until disconnect",
                self.path
            );
        }
    }
}

/// Sequential writer creating or truncating a remote file.
pub struct RemoteWriter {
    client: RemoteFsClient,
    path: String,
    file_id: u16,
    deflate: u8,
    stats: StreamStats,
    closed: bool,
}

impl RemoteWriter {
    pub(crate) fn new(
        client: RemoteFsClient,
        path: String,
        file_id: u16,
        deflate: u8,
    ) -> RemoteWriter {
        RemoteWriter {
            client,
            path,
            file_id,
            deflate,
            stats: StreamStats::default(),
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Appends `data` at the provider's current position. The chunk is
    /// compressed when that pays off and a level is configured.
    pub async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.closed {
            bail!("remote stream for {} is closed", self.path);
        }
        let (payload, effective) = deflate_opportunistic(data, self.deflate)?;
        self.stats.io_bytes += data.len() as u64;
        self.stats.wire_bytes += payload.len() as u64;

        let started = Instant::now();
        self.client
            .request_ack(Message::Write {
                file_id: self.file_id,
                deflate: effective,
                data: Bytes::from(payload),
            })
            .await?;
        self.stats.wait += started.elapsed();
        Ok(())
    }

    /// Forces buffered bytes to the provider's disk.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        if self.closed {
            bail!("remote stream for {} is closed", self.path);
        }
        self.client
            .request_ack(Message::Flush {
                file_id: self.file_id,
            })
            .await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        close_stream(&self.client, &mut self.closed, self.file_id, &self.path).await
    }
}

impl Drop for RemoteWriter {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "remote writer for {} dropped without close, provider keeps the handle until disconnect",
                self.path
            );
        }
    }
}

async fn close_stream(
    client: &RemoteFsClient,
    closed: &mut bool,
    file_id: u16,
    path: &str,
) -> anyhow::Result<()> {
    if *closed {
        return Ok(());
    }
    *closed = true;
    client.untrack_stream(file_id);
    client.send(Message::Close { file_id }).await?;
    debug!("closed remote stream #{} ({})", file_id, path);
    Ok(())
}
