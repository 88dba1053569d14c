//! TCP gateway: one reader task and one writer task per connection.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── Session "budget" ── CellStore + UndoLog
//!             ├── SessionDirectory ┤        │
//! Client B ──┘   (name → actor)   │        ├── XmlFileStore (<uuid>.xml)
//!                                 │        │
//!                                 │   ┌────┴─────┐
//!                                 │   ▼          ▼
//!                                 │ outbox A   outbox B ── writer tasks ── sockets
//!                                 └── Catalog (spreadsheet_files.txt)
//! ```
//!
//! The reader task parses one frame at a time and waits for the session's
//! acknowledgement before reading the next, so a disconnect is handled
//! only after the in-flight command has completed. Everything sent to the
//! client, replies and UPDATEs alike, goes through the connection's outbox.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broadcast::{ConnectionId, Frame, Outbox};
use crate::directory::{DirectoryError, SessionDirectory};
use crate::protocol::{
    FrameLimits, FrameReader, Request, Response, DEFAULT_MAX_LINE_LEN, DEFAULT_MAX_PAYLOAD_LEN,
};
use crate::session::{SessionError, SessionHandle};
use crate::storage::{Catalog, CatalogError, XmlFileStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Catalog of document names, passwords and files
    pub catalog_path: PathBuf,
    /// Directory holding the document XML files
    pub documents_dir: PathBuf,
    /// Longest accepted protocol line in bytes
    pub max_line_len: usize,
    /// Largest accepted cell content in bytes
    pub max_payload_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1984".to_string(),
            catalog_path: PathBuf::from("spreadsheet_files.txt"),
            documents_dir: PathBuf::from("."),
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port, all files under `dir`.
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            catalog_path: dir.join("spreadsheet_files.txt"),
            documents_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn limits(&self) -> FrameLimits {
        FrameLimits {
            max_line_len: self.max_line_len,
            max_payload_len: self.max_payload_len,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub protocol_errors: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// The spreadsheet server.
pub struct SheetServer {
    config: ServerConfig,
    directory: Arc<SessionDirectory>,
    counters: Arc<Counters>,
}

impl SheetServer {
    /// Load the catalog and set up file-backed persistence.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let catalog = Catalog::open(&config.catalog_path, &config.documents_dir)?;
        let directory = SessionDirectory::new(Arc::new(catalog), Arc::new(XmlFileStore::new()));
        Ok(Self::with_directory(config, Arc::new(directory)))
    }

    pub fn with_directory(config: ServerConfig, directory: Arc<SessionDirectory>) -> Self {
        Self {
            config,
            directory,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            protocol_errors: self.counters.protocol_errors.load(Ordering::Relaxed),
            active_sessions: self.directory.session_count().await,
        }
    }

    /// Bind `config.bind_addr` and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Spreadsheet server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let directory = self.directory.clone();
            let counters = self.counters.clone();
            let limits = self.config.limits();
            tokio::spawn(async move {
                Self::handle_connection(stream, addr, directory, counters, limits).await;
            });
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        directory: Arc<SessionDirectory>,
        counters: Arc<Counters>,
        limits: FrameLimits,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("{addr}: cannot set TCP_NODELAY: {e}");
        }
        let (read_half, mut write_half) = stream.into_split();
        let (outbox, mut outbound) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    log::debug!("{addr}: write failed: {e}");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut client = ClientState::new(directory, outbox);
        log::info!("Client {} connected from {addr}", client.id);

        let mut frames = FrameReader::new(BufReader::new(read_half), limits);
        loop {
            match frames.next_request().await {
                Ok(Some(request)) => {
                    counters.total_frames.fetch_add(1, Ordering::Relaxed);
                    client.dispatch(request).await;
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    log::debug!("{addr}: connection lost: {e}");
                    break;
                }
                Err(e) => {
                    counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{addr}: {e}");
                    client.send(Response::Error);
                }
            }
        }

        let id = client.id;
        client.disconnect().await;
        // All outbox senders are gone now, so the writer drains and stops
        drop(client);
        let _ = writer.await;

        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Client {id} ({addr}) disconnected");
    }
}

/// Per-connection protocol state.
struct ClientState {
    id: ConnectionId,
    directory: Arc<SessionDirectory>,
    outbox: Outbox,
    joined: Option<SessionHandle>,
}

impl ClientState {
    fn new(directory: Arc<SessionDirectory>, outbox: Outbox) -> Self {
        Self {
            id: ConnectionId::new(),
            directory,
            outbox,
            joined: None,
        }
    }

    fn send(&self, response: Response) {
        let _ = self.outbox.send(response.frame());
    }

    async fn dispatch(&mut self, request: Request) {
        log::debug!("{}: {} {:?}", self.id, request.command(), request.document());

        match request {
            Request::Create { name, password } => {
                let response = match self.directory.create_document(&name, &password).await {
                    Ok(_) => Response::CreateOk { name },
                    Err(e) => {
                        log_failure("CREATE", &name, &e);
                        Response::CreateFail {
                            name,
                            reason: e.to_string(),
                        }
                    }
                };
                self.send(response);
            }
            Request::Join { name, password } => {
                if let Some(current) = &self.joined {
                    log::debug!("{}: JOIN while in {:?}", self.id, current.document().name);
                    self.send(Response::JoinFail {
                        name,
                        reason: "Already joined.".to_string(),
                    });
                    return;
                }
                match self
                    .directory
                    .join(&name, &password, self.id, self.outbox.clone())
                    .await
                {
                    Ok((handle, _)) => self.joined = Some(handle),
                    Err(e) => {
                        log_failure("JOIN", &name, &e);
                        self.send(Response::JoinFail {
                            name,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Request::Change {
                name,
                version,
                cell,
                content,
            } => {
                let Some(handle) = self.session(&name) else {
                    return self.send(Response::Error);
                };
                if let Err(e) = handle.change(self.id, version, cell, content).await {
                    self.session_lost(e);
                }
            }
            Request::Undo { name, version } => {
                let Some(handle) = self.session(&name) else {
                    return self.send(Response::Error);
                };
                if let Err(e) = handle.undo(self.id, version).await {
                    self.session_lost(e);
                }
            }
            Request::Save { name } => {
                let Some(handle) = self.session(&name) else {
                    return self.send(Response::Error);
                };
                match handle.save(self.id).await {
                    // SAVE FAIL is already queued by the session
                    Ok(()) | Err(SessionError::Store(_)) => {}
                    Err(e) => self.session_lost(e),
                }
            }
            Request::Leave { name } => {
                if self.session(&name).is_none() {
                    return self.send(Response::Error);
                }
                self.disconnect().await;
            }
        }
    }

    /// Joined session, if it is the one `name` refers to.
    fn session(&self, name: &str) -> Option<SessionHandle> {
        self.joined
            .as_ref()
            .filter(|handle| handle.document().name == name)
            .cloned()
    }

    fn session_lost(&mut self, e: SessionError) {
        log::warn!("{}: session unavailable: {e}", self.id);
        self.joined = None;
        self.send(Response::Error);
    }

    async fn disconnect(&mut self) {
        if let Some(handle) = self.joined.take() {
            let presence = self.directory.leave(&handle, self.id).await;
            log::debug!("{} left {:?}: {presence:?}", self.id, handle.document().name);
        }
    }
}

fn log_failure(command: &str, name: &str, e: &DirectoryError) {
    match e {
        DirectoryError::Catalog(CatalogError::Io { .. } | CatalogError::Store(_))
        | DirectoryError::Unavailable(_) => log::error!("{command} {name:?} failed: {e}"),
        DirectoryError::Catalog(_) => log::info!("{command} {name:?} refused: {e}"),
    }
}
