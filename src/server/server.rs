//! The accepting side: binds a listener and spawns one session task per
//! inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::server::provider::{run_session, SessionInfo};

/// Serves the local file system to remote clients.
pub struct FileServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    sessions: Arc<std::sync::Mutex<FxHashMap<SocketAddr, Arc<SessionInfo>>>>,
}

impl FileServer {
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> anyhow::Result<FileServer> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!("serving files on {}", listener.local_addr()?);
        Ok(FileServer {
            listener,
            config: Arc::new(config),
            sessions: Arc::new(std::sync::Mutex::new(FxHashMap::default())),
        })
    }

    /// The actual bound address, useful with a port of `0`.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// All files currently held open by any client, with the peer that holds
    /// them.
    pub fn open_files(&self) -> Vec<(SocketAddr, String)> {
        let sessions = self.sessions.lock().expect("session registry poisoned");
        sessions
            .values()
            .flat_map(|info| {
                info.open_paths()
                    .into_iter()
                    .map(|path| (info.peer, path))
            })
            .collect()
    }

    /// Accept loop. Runs until the listener fails; a failing session only
    /// takes down that one connection.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            info!("connection from {}", peer);

            let info = Arc::new(SessionInfo::new(peer));
            self.sessions
                .lock()
                .expect("session registry poisoned")
                .insert(peer, info.clone());

            let config = self.config.clone();
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, config, info).await {
                    warn!("session with {} ended with error: {:#}", peer, e);
                }
                sessions
                    .lock()
                    .expect("session registry poisoned")
                    .remove(&peer);
            });
        }
    }
}
