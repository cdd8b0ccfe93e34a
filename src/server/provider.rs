//! Provider-side session handling: one task per client connection.
//!
//! All state for a connection (open file handles, the id counter, liveness
//! bookkeeping) is owned by its session task; nothing is shared between
//! sessions except the registry entry in [`SessionInfo`]. The session loop
//! reads with a short timeout so it can notice idleness: a client silent for
//! longer than the configured threshold gets a liveness ping, and a ping that
//! stays unanswered force-closes the connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::compress::{deflate_opportunistic, inflate};
use crate::config::ServerConfig;
use crate::correlation::SeqCounter;
use crate::protocol::file_attrs::FileAttributes;
use crate::protocol::frame::{write_frame, Envelope, FrameReader};
use crate::protocol::message::{AckCode, FileAction, Message, OpenMode, StreamAction};
use crate::protocol::wire::NO_FILE_ID;

/// Registry entry for one live session, shared with the acceptor so it can
/// report which files are currently held open and by whom.
pub struct SessionInfo {
    pub peer: SocketAddr,
    open_files: std::sync::Mutex<FxHashMap<u16, String>>,
}

impl SessionInfo {
    pub fn new(peer: SocketAddr) -> SessionInfo {
        SessionInfo {
            peer,
            open_files: std::sync::Mutex::new(FxHashMap::default()),
        }
    }

    pub fn open_paths(&self) -> Vec<String> {
        self.open_files
            .lock()
            .expect("open file table poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn record(&self, file_id: u16, path: &str) {
        self.open_files
            .lock()
            .expect("open file table poisoned")
            .insert(file_id, path.to_string());
    }

    fn remove(&self, file_id: u16) {
        self.open_files
            .lock()
            .expect("open file table poisoned")
            .remove(&file_id);
    }
}

struct ReadHandle {
    path: String,
    file: File,
    deflate: u8,
    mark: Option<u64>,
}

struct WriteHandle {
    path: String,
    file: File,
}

struct FetchJob {
    reply_to: u16,
    path: String,
    deflate: u8,
    mtu: u32,
}

struct Session {
    config: Arc<ServerConfig>,
    info: Arc<SessionInfo>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    seq: Arc<SeqCounter>,
    readers: FxHashMap<u16, ReadHandle>,
    writers: FxHashMap<u16, WriteHandle>,
    next_id: u16,
    fetch_queue: mpsc::Sender<FetchJob>,
}

/// Runs one client session to completion. Returns when the client
/// disconnects, the stream breaks, or the client fails a liveness check.
pub(crate) async fn run_session(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    info: Arc<SessionInfo>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (rd, wr) = stream.into_split();
    let mut frames = FrameReader::new(rd);
    let writer = Arc::new(Mutex::new(wr));
    let seq = Arc::new(SeqCounter::new());

    // Single-slot queue: at most one bulk transfer in flight per session,
    // a second request is rejected instead of queued behind a long download.
    let (fetch_tx, fetch_rx) = mpsc::channel::<FetchJob>(1);
    let fetch_worker = tokio::spawn(fetch_loop(
        fetch_rx,
        writer.clone(),
        seq.clone(),
        info.peer,
    ));

    let mut session = Session {
        config: config.clone(),
        info: info.clone(),
        writer: writer.clone(),
        seq,
        readers: FxHashMap::default(),
        writers: FxHashMap::default(),
        next_id: 0,
        fetch_queue: fetch_tx,
    };

    let mut last_activity = Instant::now();
    let mut ping_sent: Option<Instant> = None;

    let result = loop {
        // The deadline only bounds this wait; read_frame is cancel safe, a
        // frame split across several reads survives the timeout in between.
        let frame = tokio::time::timeout(
            config.read_timeout,
            frames.read_frame(config.max_frame_body),
        )
        .await;

        let env = match frame {
            Err(_elapsed) => {
                if let Some(sent) = ping_sent {
                    if sent.elapsed() >= config.ping_timeout {
                        warn!(
                            "client {} did not answer liveness ping, force closing",
                            info.peer
                        );
                        break Ok(());
                    }
                } else if last_activity.elapsed() >= config.idle_ping_threshold {
                    debug!("pinging idle client {}", info.peer);
                    let ping = Envelope::request(session.seq.next(), Message::Ping);
                    let mut w = writer.lock().await;
                    if let Err(e) = write_frame(&mut *w, &ping).await {
                        break Err(anyhow!("cannot ping {}: {}", info.peer, e));
                    }
                    ping_sent = Some(Instant::now());
                }
                continue;
            }
            Ok(Ok(Some(env))) => env,
            Ok(Ok(None)) => {
                debug!("client {} disconnected", info.peer);
                break Ok(());
            }
            Ok(Err(e)) => break Err(e.context(format!("session with {}", info.peer))),
        };

        last_activity = Instant::now();
        ping_sent = None;

        if env.is_reply() {
            // The only request this side sends is the liveness ping
            trace!("client {} answered #{}", info.peer, env.reply_to);
            continue;
        }
        if let Err(e) = session.dispatch(env).await {
            break Err(e.context(format!("session with {}", info.peer)));
        }
    };

    session.teardown().await;
    fetch_worker.abort();
    result
}

impl Session {
    async fn dispatch(&mut self, env: Envelope) -> anyhow::Result<()> {
        let seq = env.seq;
        match env.msg {
            Message::Open {
                path,
                mode,
                deflate,
            } => self.open(seq, &path, mode, deflate).await,
            Message::Close { file_id } => {
                self.close(file_id);
                Ok(())
            }
            Message::Read { file_id, len } => self.read(seq, file_id, len).await,
            Message::Write {
                file_id,
                deflate,
                data,
            } => self.write(seq, file_id, deflate, &data).await,
            Message::StreamAction {
                file_id,
                action,
                value,
            } => self.stream_action(seq, file_id, action, value).await,
            Message::Flush { file_id } => self.flush(seq, file_id).await,
            Message::Fetch { path, deflate, mtu } => self.fetch(seq, path, deflate, mtu).await,
            // The announced deflate level is informational; each upload chunk
            // carries its own effective level.
            Message::Put { path, deflate: _ } => self.put(seq, &path).await,
            Message::Data {
                file_id,
                has_next,
                deflate,
                data,
            } => self.put_chunk(seq, file_id, has_next, deflate, &data).await,
            Message::FileAction {
                path,
                action,
                long_arg,
                str_arg,
            } => self.file_action(seq, &path, action, long_arg, str_arg).await,
            other => {
                // Reply-only payloads arriving as requests mean the peer is
                // confused; answer with an error but keep the session up.
                warn!(
                    "client {} sent {:?} as a request",
                    self.info.peer,
                    other.tag()
                );
                self.ack_err(seq, None, format!("cannot handle {:?} request", other.tag()))
                    .await
            }
        }
    }

    async fn open(
        &mut self,
        seq: u16,
        path: &str,
        mode: OpenMode,
        deflate: u8,
    ) -> anyhow::Result<()> {
        match mode {
            OpenMode::Read => match File::open(path).await {
                Ok(file) => {
                    let file_id = self.alloc_file_id();
                    self.readers.insert(
                        file_id,
                        ReadHandle {
                            path: path.to_string(),
                            file,
                            deflate,
                            mark: None,
                        },
                    );
                    self.info.record(file_id, path);
                    debug!("{} opened {} for reading as #{}", self.info.peer, path, file_id);
                    self.ack_ok(seq, Some(file_id), 0).await
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.ack(seq, None, AckCode::Warn, 0, Some(e.to_string())).await
                }
                Err(e) => self.ack_err(seq, None, e.to_string()).await,
            },
            OpenMode::Write => match File::create(path).await {
                Ok(file) => {
                    let file_id = self.alloc_file_id();
                    self.writers.insert(
                        file_id,
                        WriteHandle {
                            path: path.to_string(),
                            file,
                        },
                    );
                    self.info.record(file_id, path);
                    debug!("{} opened {} for writing as #{}", self.info.peer, path, file_id);
                    self.ack_ok(seq, Some(file_id), 0).await
                }
                Err(e) => self.ack_err(seq, None, e.to_string()).await,
            },
        }
    }

    /// File ids are per connection and wrap; the sentinel and ids still in
    /// use are skipped.
    fn alloc_file_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != NO_FILE_ID
                && !self.readers.contains_key(&id)
                && !self.writers.contains_key(&id)
            {
                return id;
            }
        }
    }

    /// No reply by contract; closing an unknown handle is a no-op.
    fn close(&mut self, file_id: u16) {
        let known = self.readers.remove(&file_id).is_some()
            || self.writers.remove(&file_id).is_some();
        if known {
            self.info.remove(file_id);
            debug!("{} closed #{}", self.info.peer, file_id);
        } else {
            debug!(
                "{} closed unknown handle #{}, ignoring",
                self.info.peer, file_id
            );
        }
    }

    async fn read(&mut self, seq: u16, file_id: u16, len: u32) -> anyhow::Result<()> {
        let Some(handle) = self.readers.get_mut(&file_id) else {
            return self.ack_unknown_handle(seq, file_id, "read").await;
        };

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        let read_result = loop {
            if filled == buf.len() {
                break Ok(());
            }
            match handle.file.read(&mut buf[filled..]).await {
                Ok(0) => break Ok(()),
                Ok(n) => filled += n,
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = read_result {
            let path = handle.path.clone();
            return self
                .ack_err(seq, Some(file_id), format!("read from {} failed: {}", path, e))
                .await;
        }
        buf.truncate(filled);

        // An empty chunk for a non-empty request signals end of file
        let (payload, effective) = deflate_opportunistic(&buf, handle.deflate)?;
        self.reply(
            seq,
            Message::Data {
                file_id: Some(file_id),
                has_next: false,
                deflate: effective,
                data: Bytes::from(payload),
            },
        )
        .await
    }

    async fn write(
        &mut self,
        seq: u16,
        file_id: u16,
        deflate: u8,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let Some(handle) = self.writers.get_mut(&file_id) else {
            return self.ack_unknown_handle(seq, file_id, "write").await;
        };

        let result = async {
            let plain;
            let bytes: &[u8] = if deflate > 0 {
                plain = inflate(data)?;
                &plain
            } else {
                data
            };
            handle.file.write_all(bytes).await?;
            Ok::<usize, anyhow::Error>(bytes.len())
        }
        .await;

        match result {
            Ok(n) => self.ack_ok(seq, Some(file_id), n as i64).await,
            Err(e) => {
                let path = handle.path.clone();
                self.ack_err(seq, Some(file_id), format!("write to {} failed: {}", path, e))
                    .await
            }
        }
    }

    async fn stream_action(
        &mut self,
        seq: u16,
        file_id: u16,
        action: StreamAction,
        value: i64,
    ) -> anyhow::Result<()> {
        let Some(handle) = self.readers.get_mut(&file_id) else {
            return self.ack_unknown_handle(seq, file_id, "read").await;
        };

        let result: anyhow::Result<i64> = async {
            match action {
                StreamAction::Available => {
                    let pos = handle.file.stream_position().await?;
                    let len = handle.file.metadata().await?.len();
                    Ok(len.saturating_sub(pos) as i64)
                }
                StreamAction::Skip => {
                    let pos = handle.file.stream_position().await?;
                    let len = handle.file.metadata().await?.len();
                    let target = pos.saturating_add(value.max(0) as u64).min(len);
                    handle.file.seek(SeekFrom::Start(target)).await?;
                    Ok((target - pos) as i64)
                }
                StreamAction::MarkSupported => Ok(1),
                StreamAction::Mark => {
                    handle.mark = Some(handle.file.stream_position().await?);
                    Ok(0)
                }
                StreamAction::Reset => match handle.mark {
                    Some(mark) => {
                        handle.file.seek(SeekFrom::Start(mark)).await?;
                        Ok(0)
                    }
                    None => bail!("no mark set on {}", handle.path),
                },
            }
        }
        .await;

        match result {
            Ok(v) => self.ack_ok(seq, Some(file_id), v).await,
            Err(e) => self.ack_err(seq, Some(file_id), e.to_string()).await,
        }
    }

    async fn flush(&mut self, seq: u16, file_id: u16) -> anyhow::Result<()> {
        let Some(handle) = self.writers.get_mut(&file_id) else {
            return self.ack_unknown_handle(seq, file_id, "write").await;
        };
        match handle.file.sync_data().await {
            Ok(_) => self.ack_ok(seq, Some(file_id), 1).await,
            Err(e) => {
                let path = handle.path.clone();
                self.ack_err(seq, Some(file_id), format!("flush of {} failed: {}", path, e))
                    .await
            }
        }
    }

    async fn fetch(&mut self, seq: u16, path: String, deflate: u8, mtu: u32) -> anyhow::Result<()> {
        let job = FetchJob {
            reply_to: seq,
            path,
            deflate,
            mtu: mtu.max(256),
        };
        match self.fetch_queue.try_send(job) {
            Ok(_) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.ack_err(
                    seq,
                    None,
                    format!("bulk transfer of {} rejected, another one is running", job.path),
                )
                .await
            }
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("bulk transfer worker is gone"),
        }
    }

    async fn put(&mut self, seq: u16, path: &str) -> anyhow::Result<()> {
        match File::create(path).await {
            Ok(file) => {
                let file_id = self.alloc_file_id();
                self.writers.insert(
                    file_id,
                    WriteHandle {
                        path: path.to_string(),
                        file,
                    },
                );
                self.info.record(file_id, path);
                debug!("{} uploading to {} as #{}", self.info.peer, path, file_id);
                self.ack_ok(seq, Some(file_id), 0).await
            }
            Err(e) => self.ack_err(seq, None, e.to_string()).await,
        }
    }

    /// Upload chunk. Only failed and final chunks are acked so a fast sender
    /// is not throttled to one round trip per chunk.
    async fn put_chunk(
        &mut self,
        seq: u16,
        file_id: Option<u16>,
        has_next: bool,
        deflate: u8,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let Some(file_id) = file_id else {
            return self.ack_err(seq, None, "upload chunk without a file id".to_string()).await;
        };
        let Some(handle) = self.writers.get_mut(&file_id) else {
            return self
                .ack(seq, Some(file_id), AckCode::Warn, 0, Some(format!("unknown upload handle #{}", file_id)))
                .await;
        };

        let result = async {
            let plain;
            let bytes: &[u8] = if deflate > 0 {
                plain = inflate(data)?;
                &plain
            } else {
                data
            };
            handle.file.write_all(bytes).await?;
            if !has_next {
                handle.file.sync_data().await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match result {
            Ok(_) if has_next => Ok(()),
            Ok(_) => {
                let path = handle.path.clone();
                self.writers.remove(&file_id);
                self.info.remove(file_id);
                debug!("{} finished upload of {}", self.info.peer, path);
                self.ack_ok(seq, Some(file_id), 0).await
            }
            Err(e) => {
                let path = handle.path.clone();
                self.writers.remove(&file_id);
                self.info.remove(file_id);
                self.ack_err(seq, Some(file_id), format!("upload to {} failed: {}", path, e))
                    .await
            }
        }
    }

    async fn file_action(
        &mut self,
        seq: u16,
        path: &str,
        action: FileAction,
        long_arg: i64,
        str_arg: Option<String>,
    ) -> anyhow::Result<()> {
        let path_buf = PathBuf::from(path);
        let result = match action {
            FileAction::GetAttributes => {
                let attrs =
                    tokio::task::spawn_blocking(move || FileAttributes::from_path(&path_buf))
                        .await?;
                return self.reply(seq, Message::FileAttrs { attrs }).await;
            }
            FileAction::ListFiles => {
                let entries = tokio::task::spawn_blocking(move || list_dir(&path_buf)).await?;
                return self.reply(seq, Message::FileList { entries }).await;
            }
            FileAction::ListRoots => {
                let entries = tokio::task::spawn_blocking(list_roots).await?;
                return self.reply(seq, Message::FileList { entries }).await;
            }
            FileAction::CreateNew => {
                tokio::task::spawn_blocking(move || {
                    Ok(bool_result(
                        std::fs::OpenOptions::new()
                            .write(true)
                            .create_new(true)
                            .open(&path_buf)
                            .map(|_| ()),
                    ))
                })
                .await?
            }
            FileAction::Delete => {
                tokio::task::spawn_blocking(move || {
                    Ok(match std::fs::symlink_metadata(&path_buf) {
                        Ok(m) if m.is_dir() => bool_result(std::fs::remove_dir(&path_buf)),
                        Ok(_) => bool_result(std::fs::remove_file(&path_buf)),
                        Err(_) => 0,
                    })
                })
                .await?
            }
            FileAction::Mkdir => {
                tokio::task::spawn_blocking(move || Ok(bool_result(std::fs::create_dir(&path_buf))))
                    .await?
            }
            FileAction::Mkdirs => {
                tokio::task::spawn_blocking(move || {
                    Ok(bool_result(std::fs::create_dir_all(&path_buf)))
                })
                .await?
            }
            FileAction::Rename => match str_arg {
                Some(target) => {
                    tokio::task::spawn_blocking(move || {
                        Ok(bool_result(std::fs::rename(&path_buf, target)))
                    })
                    .await?
                }
                None => Err(anyhow!("rename without a target path")),
            },
            FileAction::SetLastModified => {
                tokio::task::spawn_blocking(move || set_modified_millis(&path_buf, long_arg)).await?
            }
            FileAction::SetReadable => {
                tokio::task::spawn_blocking(move || set_permission(&path_buf, 0o444, long_arg != 0))
                    .await?
            }
            FileAction::SetWritable => {
                tokio::task::spawn_blocking(move || set_permission(&path_buf, 0o222, long_arg != 0))
                    .await?
            }
            FileAction::SetExecutable => {
                tokio::task::spawn_blocking(move || set_permission(&path_buf, 0o111, long_arg != 0))
                    .await?
            }
            FileAction::SetReadOnly => {
                tokio::task::spawn_blocking(move || set_permission(&path_buf, 0o222, false)).await?
            }
            FileAction::FreeSpace => {
                tokio::task::spawn_blocking(move || Ok(space(&path_buf).0)).await?
            }
            FileAction::TotalSpace => {
                tokio::task::spawn_blocking(move || Ok(space(&path_buf).1)).await?
            }
            FileAction::UsableSpace => {
                tokio::task::spawn_blocking(move || Ok(space(&path_buf).2)).await?
            }
        };

        match result {
            Ok(value) => self.reply(seq, Message::FileLong { value }).await,
            Err(e) => {
                self.ack_err(seq, None, format!("{:?} on {} failed: {}", action, path, e))
                    .await
            }
        }
    }

    async fn ack_ok(&self, reply_to: u16, file_id: Option<u16>, value: i64) -> anyhow::Result<()> {
        self.ack(reply_to, file_id, AckCode::Ok, value, None).await
    }

    /// Unknown handles get a soft failure: the client may have raced a close,
    /// the connection stays usable.
    async fn ack_unknown_handle(
        &self,
        reply_to: u16,
        file_id: u16,
        kind: &str,
    ) -> anyhow::Result<()> {
        debug!("{} referenced unknown {} handle #{}", self.info.peer, kind, file_id);
        self.ack(
            reply_to,
            Some(file_id),
            AckCode::Warn,
            0,
            Some(format!("unknown {} handle #{}", kind, file_id)),
        )
        .await
    }

    async fn ack_err(
        &self,
        reply_to: u16,
        file_id: Option<u16>,
        message: String,
    ) -> anyhow::Result<()> {
        debug!("{}: {}", self.info.peer, message);
        self.ack(reply_to, file_id, AckCode::Err, 0, Some(message))
            .await
    }

    async fn ack(
        &self,
        reply_to: u16,
        file_id: Option<u16>,
        code: AckCode,
        value: i64,
        message: Option<String>,
    ) -> anyhow::Result<()> {
        self.reply(
            reply_to,
            Message::Ack {
                file_id,
                code,
                value,
                message,
            },
        )
        .await
    }

    async fn reply(&self, reply_to: u16, msg: Message) -> anyhow::Result<()> {
        let env = Envelope::reply(self.seq.next(), reply_to, msg);
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &env).await
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.writers.drain() {
            if let Err(e) = handle.file.sync_data().await {
                warn!("cannot flush {} on session close: {}", handle.path, e);
            }
        }
        self.readers.clear();
        self.info
            .open_files
            .lock()
            .expect("open file table poisoned")
            .clear();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Streams a whole file as a sequence of `Data` replies. Runs on its own task
/// so the session loop stays responsive for other requests meanwhile.
async fn fetch_loop(
    mut jobs: mpsc::Receiver<FetchJob>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    seq: Arc<SeqCounter>,
    peer: SocketAddr,
) {
    while let Some(job) = jobs.recv().await {
        // File errors are reported to the client inside run_fetch; an Err
        // here means the socket broke. The worker stays up either way, the
        // session loop decides when the connection is over.
        if let Err(e) = run_fetch(&job, &writer, &seq).await {
            error!("bulk transfer of {} to {} broke: {:#}", job.path, peer, e);
        }
    }
}

async fn run_fetch(
    job: &FetchJob,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    seq: &Arc<SeqCounter>,
) -> anyhow::Result<()> {
    let mut file = match File::open(&job.path).await {
        Ok(f) => f,
        Err(e) => {
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                AckCode::Warn
            } else {
                AckCode::Err
            };
            let nack = Envelope::reply(
                seq.next(),
                job.reply_to,
                Message::Ack {
                    file_id: None,
                    code,
                    value: 0,
                    message: Some(e.to_string()),
                },
            );
            let mut w = writer.lock().await;
            return write_frame(&mut *w, &nack).await;
        }
    };

    let mut buf = vec![0u8; job.mtu as usize];
    loop {
        let mut filled = 0;
        let read_result = loop {
            if filled == buf.len() {
                break Ok(());
            }
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break Ok(()),
                Ok(n) => filled += n,
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = read_result {
            // A failure mid-transfer arrives as an error ack in place of the
            // next chunk, so the client stops waiting for data.
            let nack = Envelope::reply(
                seq.next(),
                job.reply_to,
                Message::Ack {
                    file_id: None,
                    code: AckCode::Err,
                    value: 0,
                    message: Some(format!("reading {} failed: {}", job.path, e)),
                },
            );
            let mut w = writer.lock().await;
            return write_frame(&mut *w, &nack).await;
        }

        // A full chunk cannot rule out a following empty one, so `has_next`
        // stays set until a short chunk is seen.
        let has_next = filled == buf.len();
        let (payload, effective) = deflate_opportunistic(&buf[..filled], job.deflate)?;
        let env = Envelope::reply(
            seq.next(),
            job.reply_to,
            Message::Data {
                file_id: None,
                has_next,
                deflate: effective,
                data: Bytes::from(payload),
            },
        );
        {
            let mut w = writer.lock().await;
            write_frame(&mut *w, &env).await?;
        }
        if !has_next {
            trace!("finished streaming {}", job.path);
            return Ok(());
        }
    }
}

fn list_dir(path: &Path) -> Vec<FileAttributes> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut result: Vec<FileAttributes> = entries
        .flatten()
        .map(|e| FileAttributes::from_path(&e.path()))
        .collect();
    result.sort_by(|a, b| a.name.cmp(&b.name));
    result
}

#[cfg(unix)]
fn list_roots() -> Vec<FileAttributes> {
    vec![FileAttributes::from_path(Path::new("/"))]
}

#[cfg(not(unix))]
fn list_roots() -> Vec<FileAttributes> {
    // Probe drive letters the way the usual suspects do
    (b'A'..=b'Z')
        .map(|c| format!("{}:\\", c as char))
        .filter(|p| std::fs::metadata(p).is_ok())
        .map(|p| FileAttributes::from_path(Path::new(&p)))
        .collect()
}

fn bool_result(r: std::io::Result<()>) -> i64 {
    r.is_ok() as i64
}

fn set_modified_millis(path: &Path, millis: i64) -> anyhow::Result<i64> {
    if millis < 0 {
        bail!("negative modification time");
    }
    let time = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(millis as u64);
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(time)?;
    Ok(1)
}

#[cfg(unix)]
fn set_permission(path: &Path, bits: u32, grant: bool) -> anyhow::Result<i64> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)?;
    let mut mode = meta.permissions().mode();
    if grant {
        mode |= bits;
    } else {
        mode &= !bits;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(1)
}

#[cfg(not(unix))]
fn set_permission(path: &Path, bits: u32, grant: bool) -> anyhow::Result<i64> {
    // Only the write bit maps to anything portable
    if bits != 0o222 {
        return Ok(0);
    }
    let meta = std::fs::metadata(path)?;
    let mut perms = meta.permissions();
    perms.set_readonly(!grant);
    std::fs::set_permissions(path, perms)?;
    Ok(1)
}

/// (free, total, usable) bytes of the partition holding `path`, zeros when
/// the query fails.
#[cfg(unix)]
fn space(path: &Path) -> (i64, i64, i64) {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return (0, 0, 0);
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return (0, 0, 0);
    }
    let frsize = stat.f_frsize as i64;
    (
        stat.f_bfree as i64 * frsize,
        stat.f_blocks as i64 * frsize,
        stat.f_bavail as i64 * frsize,
    )
}

#[cfg(not(unix))]
fn space(_path: &Path) -> (i64, i64, i64) {
    (0, 0, 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_list_dir_is_sorted_and_tolerates_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = list_dir(dir.path());
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(entries[2].is_directory());

        assert!(list_dir(Path::new("/no/such/dir")).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_space_reports_something_for_tmp() {
        let (free, total, usable) = space(Path::new("/tmp"));
        assert!(total > 0);
        assert!(free >= usable);
    }

    #[test]
    fn test_set_modified_millis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        set_modified_millis(&path, 1_600_000_000_000).unwrap();
        let attrs = FileAttributes::from_path(&path);
        assert_eq!(attrs.modified_millis, 1_600_000_000_000);
        assert!(set_modified_millis(&path, -5).is_err());
    }

    #[test]
    fn test_bool_result() {
        assert_eq!(bool_result(Ok(())), 1);
        assert_eq!(
            bool_result(Err(std::io::Error::from(std::io::ErrorKind::NotFound))),
            0
        );
    }
}
