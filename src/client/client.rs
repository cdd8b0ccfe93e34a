//! Client-side connection handling.
//!
//! A [`RemoteFsClient`] owns one TCP connection to a provider. Requests can be
//! issued concurrently from any number of tasks; a dedicated reader task
//! demultiplexes inbound frames into the reply queue and handles the few
//! messages a provider may send on its own (liveness pings, stream pushes).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashSet;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::remote_file::RemoteFile;
use crate::client::remote_stream::{RemoteReader, RemoteWriter};
use crate::compress::{deflate_opportunistic, inflate};
use crate::config::ClientConfig;
use crate::correlation::{ReplyQueue, ReplyTimeout, SeqCounter};
use crate::protocol::frame::{write_frame, Envelope, FrameReader};
use crate::protocol::message::{AckCode, FileAction, Message, OpenMode};
use crate::protocol::wire::NO_FILE_ID;

/// Callback for provider-initiated messages that refer to a stream this
/// client has open. Applications that do not install one get the messages
/// logged and dropped.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpontaneousHandler: Send + Sync {
    async fn on_message(&self, env: Envelope);
}

struct LatencyAccumulator {
    total_micros: u64,
    samples: u64,
}

struct ClientInner {
    config: ClientConfig,
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    seq: SeqCounter,
    replies: Arc<ReplyQueue>,
    open_streams: std::sync::Mutex<FxHashSet<u16>>,
    latency: std::sync::Mutex<LatencyAccumulator>,
    closed: AtomicBool,
}

/// Handle to a provider connection. Cheap to clone; all clones share the
/// underlying connection.
#[derive(Clone)]
pub struct RemoteFsClient {
    inner: Arc<ClientInner>,
}

impl RemoteFsClient {
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> anyhow::Result<RemoteFsClient> {
        RemoteFsClient::connect_with_handler(addr, config, None).await
    }

    pub async fn connect_with_handler(
        addr: SocketAddr,
        config: ClientConfig,
        handler: Option<Arc<dyn SpontaneousHandler>>,
    ) -> anyhow::Result<RemoteFsClient> {
        config.validate()?;

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await;
        let stream = match stream {
            Ok(s) => s?,
            Err(_) => bail!("connecting to {} timed out", addr),
        };
        stream.set_nodelay(true)?;
        info!("connected to file provider at {}", addr);

        let (rd, wr) = stream.into_split();
        let inner = Arc::new(ClientInner {
            config,
            peer: addr,
            writer: Mutex::new(wr),
            seq: SeqCounter::new(),
            replies: Arc::new(ReplyQueue::new()),
            open_streams: std::sync::Mutex::new(FxHashSet::default()),
            latency: std::sync::Mutex::new(LatencyAccumulator {
                total_micros: 0,
                samples: 0,
            }),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(reader_loop(rd, inner.clone(), handler));

        Ok(RemoteFsClient { inner })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.replies.is_closed()
    }

    /// Mean round trip time over all request/reply pairs so far.
    pub fn average_latency(&self) -> Option<Duration> {
        let acc = self.inner.latency.lock().expect("latency lock poisoned");
        if acc.samples == 0 {
            return None;
        }
        Some(Duration::from_micros(acc.total_micros / acc.samples))
    }

    pub(crate) fn default_deflate(&self) -> u8 {
        self.inner.config.deflate
    }

    pub(crate) fn mtu(&self) -> usize {
        self.inner.config.mtu
    }

    /// Sends a request frame, returning the sequence number to wait on.
    pub(crate) async fn send(&self, msg: Message) -> anyhow::Result<u16> {
        if self.is_closed() {
            bail!("connection to {} is closed", self.inner.peer);
        }
        let seq = self.inner.seq.next();
        let env = Envelope::request(seq, msg);
        let mut writer = self.inner.writer.lock().await;
        write_frame(&mut *writer, &env).await?;
        Ok(seq)
    }

    pub(crate) async fn await_reply(
        &self,
        seq: u16,
        timeout: ReplyTimeout,
    ) -> Option<Envelope> {
        self.inner.replies.await_reply(seq, timeout).await
    }

    /// Request/reply with latency bookkeeping. Waits at most the configured
    /// `request_timeout`; a silent provider turns into an error instead of a
    /// caller blocked forever.
    pub(crate) async fn request(&self, msg: Message) -> anyhow::Result<Message> {
        let started = Instant::now();
        let seq = self.send(msg).await?;
        let timeout = self.inner.config.request_timeout;
        let Some(env) = self.await_reply(seq, ReplyTimeout::After(timeout)).await else {
            if self.is_closed() {
                bail!("connection to {} closed while waiting for a reply", self.inner.peer);
            }
            bail!(
                "no reply from {} within {:?}",
                self.inner.peer,
                timeout
            );
        };

        let elapsed = started.elapsed().as_micros() as u64;
        let mut acc = self.inner.latency.lock().expect("latency lock poisoned");
        acc.total_micros += elapsed;
        acc.samples += 1;

        Ok(env.msg)
    }

    /// Request expecting an `Ack`. `Err` acks become errors, `Ok` and `Warn`
    /// are returned for the caller to interpret.
    pub(crate) async fn request_ack(
        &self,
        msg: Message,
    ) -> anyhow::Result<(AckCode, Option<u16>, i64, Option<String>)> {
        match self.request(msg).await? {
            Message::Ack {
                file_id,
                code: AckCode::Err,
                message,
                ..
            } => {
                bail!(
                    "provider error: {}",
                    message.unwrap_or_else(|| format!("file id {:?}", file_id))
                );
            }
            Message::Ack {
                file_id,
                code,
                value,
                message,
            } => Ok((code, file_id, value, message)),
            other => bail!("expected an ack, got {:?}", other.tag()),
        }
    }

    /// Opens a provider-side file for sequential reading.
    pub async fn open_reader(&self, path: &str) -> anyhow::Result<RemoteReader> {
        self.open_reader_deflate(path, self.default_deflate()).await
    }

    pub async fn open_reader_deflate(
        &self,
        path: &str,
        deflate: u8,
    ) -> anyhow::Result<RemoteReader> {
        let file_id = self
            .open_stream(path, OpenMode::Read, deflate)
            .await?;
        Ok(RemoteReader::new(self.clone(), path.to_string(), file_id))
    }

    /// Opens (creating or truncating) a provider-side file for writing.
    pub async fn open_writer(&self, path: &str) -> anyhow::Result<RemoteWriter> {
        let deflate = self.default_deflate();
        let file_id = self.open_stream(path, OpenMode::Write, deflate).await?;
        Ok(RemoteWriter::new(
            self.clone(),
            path.to_string(),
            file_id,
            deflate,
        ))
    }

    async fn open_stream(
        &self,
        path: &str,
        mode: OpenMode,
        deflate: u8,
    ) -> anyhow::Result<u16> {
        let (code, file_id, _, message) = self
            .request_ack(Message::Open {
                path: path.to_string(),
                mode,
                deflate,
            })
            .await?;
        if code == AckCode::Warn {
            bail!(
                "file not found: {} ({})",
                path,
                message.unwrap_or_default()
            );
        }
        let Some(file_id) = file_id else {
            bail!("provider acked open of {} without a file id", path);
        };
        self.track_stream(file_id);
        debug!("opened {} as remote stream #{}", path, file_id);
        Ok(file_id)
    }

    pub(crate) fn track_stream(&self, file_id: u16) {
        self.inner
            .open_streams
            .lock()
            .expect("stream set poisoned")
            .insert(file_id);
    }

    pub(crate) fn untrack_stream(&self, file_id: u16) {
        self.inner
            .open_streams
            .lock()
            .expect("stream set poisoned")
            .remove(&file_id);
    }

    /// Downloads a whole file in one call. The provider streams it in chunks
    /// of at most the configured MTU; the result is the reassembled content.
    pub async fn fetch_file(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let seq = self
            .send(Message::Fetch {
                path: path.to_string(),
                deflate: self.default_deflate(),
                mtu: self.mtu() as u32,
            })
            .await?;

        let timeout = self.inner.config.request_timeout;
        let mut out = Vec::new();
        loop {
            let Some(env) = self.await_reply(seq, ReplyTimeout::After(timeout)).await else {
                if self.is_closed() {
                    bail!("connection closed during bulk fetch of {}", path);
                }
                bail!("bulk fetch of {} stalled, no chunk within {:?}", path, timeout);
            };
            match env.msg {
                Message::Data {
                    has_next,
                    deflate,
                    data,
                    ..
                } => {
                    if deflate > 0 {
                        out.extend_from_slice(&inflate(&data)?);
                    } else {
                        out.extend_from_slice(&data);
                    }
                    if !has_next {
                        return Ok(out);
                    }
                }
                Message::Ack { code, message, .. } => {
                    let reason = message.unwrap_or_default();
                    if code == AckCode::Warn {
                        bail!("file not found: {} ({})", path, reason);
                    }
                    bail!("bulk fetch of {} failed: {}", path, reason);
                }
                other => bail!("unexpected bulk fetch reply {:?}", other.tag()),
            }
        }
    }

    /// Uploads `data` as the new content of the provider-side file `path`.
    pub async fn put_file(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        let deflate = self.default_deflate();
        let (_, file_id, _, _) = self
            .request_ack(Message::Put {
                path: path.to_string(),
                deflate,
            })
            .await?;
        let Some(file_id) = file_id else {
            bail!("provider acked put of {} without a file id", path);
        };

        let mtu = self.mtu();
        let mut offset = 0usize;
        let mut prev_seq: Option<u16> = None;
        loop {
            // The provider only acks failed or final chunks. Polling the
            // previous chunk's sequence number surfaces write errors early
            // instead of at the end of a long upload.
            if let Some(prev) = prev_seq {
                if let Some(env) = self.await_reply(prev, ReplyTimeout::Poll).await {
                    self.fail_on_error_ack(path, env.msg)?;
                }
            }

            let end = (offset + mtu).min(data.len());
            let has_next = end < data.len();
            let (payload, effective) = deflate_opportunistic(&data[offset..end], deflate)?;
            let seq = self
                .send(Message::Data {
                    file_id: Some(file_id),
                    has_next,
                    deflate: effective,
                    data: Bytes::from(payload),
                })
                .await?;

            if !has_next {
                let timeout = self.inner.config.request_timeout;
                let Some(env) = self.await_reply(seq, ReplyTimeout::After(timeout)).await else {
                    if self.is_closed() {
                        bail!("connection closed during upload of {}", path);
                    }
                    bail!("upload of {} not acknowledged within {:?}", path, timeout);
                };
                self.fail_on_error_ack(path, env.msg)?;
                debug!("uploaded {} bytes to {}", data.len(), path);
                return Ok(());
            }
            prev_seq = Some(seq);
            offset = end;
        }
    }

    fn fail_on_error_ack(&self, path: &str, msg: Message) -> anyhow::Result<()> {
        match msg {
            Message::Ack {
                code: AckCode::Ok, ..
            } => Ok(()),
            Message::Ack { message, .. } => {
                bail!(
                    "upload of {} rejected by provider: {}",
                    path,
                    message.unwrap_or_default()
                );
            }
            other => bail!("unexpected upload reply {:?}", other.tag()),
        }
    }

    /// One-shot metadata operation, see [`FileAction`] for the catalogue.
    pub(crate) async fn file_action(
        &self,
        path: &str,
        action: FileAction,
        long_arg: i64,
        str_arg: Option<String>,
    ) -> anyhow::Result<Message> {
        self.request(Message::FileAction {
            path: path.to_string(),
            action,
            long_arg,
            str_arg,
        })
        .await
    }

    /// A path-based view on the provider's file system, patterned after a
    /// local file handle.
    pub fn remote_file(&self, path: &str) -> RemoteFile {
        RemoteFile::new(self.clone(), path.to_string())
    }

    /// Closes all open streams and shuts the connection down. Waits for the
    /// provider to confirm by closing its end.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let open: Vec<u16> = {
            let streams = self
                .inner
                .open_streams
                .lock()
                .expect("stream set poisoned");
            streams.iter().copied().collect()
        };

        let mut writer = self.inner.writer.lock().await;
        for file_id in open {
            let env = Envelope::request(self.inner.seq.next(), Message::Close { file_id });
            if let Err(e) = write_frame(&mut *writer, &env).await {
                warn!("cannot close remote stream #{}: {}", file_id, e);
                break;
            }
        }
        // Half-close; the reader task drains until the provider closes its end
        writer.shutdown().await?;
        info!("disconnected from file provider at {}", self.inner.peer);
        Ok(())
    }
}

async fn reader_loop(
    rd: OwnedReadHalf,
    inner: Arc<ClientInner>,
    handler: Option<Arc<dyn SpontaneousHandler>>,
) {
    let mut frames = FrameReader::new(rd);
    loop {
        match frames.read_frame(inner.config.max_frame_body).await {
            Ok(Some(env)) => {
                if env.is_reply() {
                    trace!("reply to #{}: {:?}", env.reply_to, env.msg.tag());
                    inner.replies.push(env);
                    continue;
                }
                handle_spontaneous(&inner, &handler, env).await;
            }
            Ok(None) => {
                debug!("provider {} closed the connection", inner.peer);
                break;
            }
            Err(e) => {
                if !inner.closed.load(Ordering::Acquire) {
                    error!("connection to {} broke: {:#}", inner.peer, e);
                }
                break;
            }
        }
    }
    inner.closed.store(true, Ordering::Release);
    inner.replies.close();
}

/// A request frame from the provider. Pings are answered right here; stream
/// messages go to the application handler if one is installed. Messages for a
/// handle we do not have open get a `Close` sent back so the provider can
/// release whatever it thinks it is talking to.
async fn handle_spontaneous(
    inner: &Arc<ClientInner>,
    handler: &Option<Arc<dyn SpontaneousHandler>>,
    env: Envelope,
) {
    if env.msg == Message::Ping {
        trace!("answering liveness ping from {}", inner.peer);
        let pong = Envelope::reply(inner.seq.next(), env.seq, Message::Ping);
        let mut writer = inner.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &pong).await {
            warn!("cannot answer ping from {}: {}", inner.peer, e);
        }
        return;
    }

    match env.msg.file_id() {
        Some(file_id) if file_id != NO_FILE_ID => {
            let tracked = inner
                .open_streams
                .lock()
                .expect("stream set poisoned")
                .contains(&file_id);
            if tracked {
                match handler {
                    Some(h) => h.on_message(env).await,
                    None => debug!(
                        "dropping unsolicited {:?} for stream #{}, no handler installed",
                        env.msg.tag(),
                        file_id
                    ),
                }
            } else {
                warn!(
                    "provider {} sent {:?} for unknown stream #{}, asking it to close",
                    inner.peer,
                    env.msg.tag(),
                    file_id
                );
                let close = Envelope::request(inner.seq.next(), Message::Close { file_id });
                let mut writer = inner.writer.lock().await;
                if let Err(e) = write_frame(&mut *writer, &close).await {
                    warn!("cannot send close for unknown stream: {}", e);
                }
            }
        }
        _ => warn!(
            "dropping unsolicited {:?} from {} without a stream reference",
            env.msg.tag(),
            inner.peer
        ),
    }
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;

    use super::*;

    /// The accept side of a loopback connection, standing in for a provider.
    async fn fake_provider() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_ping_is_answered_automatically() {
        let (listener, addr) = fake_provider().await;
        let _client = RemoteFsClient::connect(addr, ClientConfig::default())
            .await
            .unwrap();
        let (mut provider, _) = listener.accept().await.unwrap();

        write_frame(&mut provider, &Envelope::request(17, Message::Ping))
            .await
            .unwrap();

        let mut frames = FrameReader::new(&mut provider);
        let pong = frames.read_frame(1024).await.unwrap().unwrap();
        assert_eq!(pong.reply_to, 17);
        assert_eq!(pong.msg, Message::Ping);
    }

    #[tokio::test]
    async fn test_spontaneous_message_for_tracked_stream_reaches_handler() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handler = MockSpontaneousHandler::new();
        handler.expect_on_message().returning(move |env| {
            tx.send(env).unwrap();
        });

        let (listener, addr) = fake_provider().await;
        let client = RemoteFsClient::connect_with_handler(
            addr,
            ClientConfig::default(),
            Some(Arc::new(handler)),
        )
        .await
        .unwrap();
        let (mut provider, _) = listener.accept().await.unwrap();

        client.track_stream(5);
        let pushed = Envelope::request(
            1,
            Message::Data {
                file_id: Some(5),
                has_next: false,
                deflate: 0,
                data: Bytes::from_static(b"pushed"),
            },
        );
        write_frame(&mut provider, &pushed).await.unwrap();

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.msg.file_id(), Some(5));
    }

    #[tokio::test]
    async fn test_message_for_unknown_stream_triggers_close() {
        let (listener, addr) = fake_provider().await;
        let _client = RemoteFsClient::connect(addr, ClientConfig::default())
            .await
            .unwrap();
        let (mut provider, _) = listener.accept().await.unwrap();

        let pushed = Envelope::request(
            1,
            Message::Data {
                file_id: Some(7),
                has_next: false,
                deflate: 0,
                data: Bytes::new(),
            },
        );
        write_frame(&mut provider, &pushed).await.unwrap();

        let mut frames = FrameReader::new(&mut provider);
        let answer = frames.read_frame(1024).await.unwrap().unwrap();
        assert_eq!(answer.msg, Message::Close { file_id: 7 });
    }

    #[tokio::test]
    async fn test_requests_fail_once_the_provider_is_gone() {
        let (listener, addr) = fake_provider().await;
        let client = RemoteFsClient::connect(addr, ClientConfig::default())
            .await
            .unwrap();
        let (provider, _) = listener.accept().await.unwrap();
        drop(provider);

        // The reader task notices the close and fails the pending wait
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.request(Message::Ping),
        )
        .await;
        assert!(result.expect("must not hang").is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_silent_provider_times_a_request_out() {
        let (listener, addr) = fake_provider().await;
        let config = ClientConfig {
            request_timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        };
        let client = RemoteFsClient::connect(addr, config).await.unwrap();
        // Accept but never answer anything
        let (_provider, _) = listener.accept().await.unwrap();

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.request(Message::Ping),
        )
        .await;
        let err = result.expect("must not wait forever").unwrap_err();
        assert!(err.to_string().contains("no reply"), "got: {:#}", err);
        assert!(started.elapsed() >= Duration::from_millis(200));
        // The connection itself is still alive, only the request gave up
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let (listener, addr) = fake_provider().await;
        drop(listener);
        assert!(RemoteFsClient::connect(addr, ClientConfig::default())
            .await
            .is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_connecting() {
        let config = ClientConfig {
            deflate: 200,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_handle_is_send_sync_clone() {
        fn assert_bounds<T: Send + Sync + Clone>() {}
        assert_bounds::<RemoteFsClient>();
    }
}
