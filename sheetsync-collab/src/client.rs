//! TCP client for the spreadsheet server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Typed request sending and response reading
//! - JOIN snapshot decoding into a [`CellStore`]
//!
//! Used by the integration tests and handy for scripting a server by hand.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::cells::CellStore;
use crate::protocol::{FrameLimits, FrameReader, ProtocolError, Request, Response};
use crate::storage::{decode_spreadsheet, StoreError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("bad snapshot: {0}")]
    Snapshot(#[from] StoreError),

    #[error("server closed the connection")]
    Closed,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("unexpected response {0:?}")]
    Unexpected(Box<Response>),
}

/// A joined document as delivered by `JOIN OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedDocument {
    pub name: String,
    pub version: u64,
    pub cells: CellStore,
}

/// Line-protocol client over one TCP connection.
pub struct SyncClient {
    frames: FrameReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    state: ConnectionState,
}

impl SyncClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        Self::connect_with_limits(addr, FrameLimits::default()).await
    }

    pub async fn connect_with_limits(
        addr: impl ToSocketAddrs,
        limits: FrameLimits,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        log::debug!("Connected to {}", writer.peer_addr()?);
        Ok(Self {
            frames: FrameReader::new(BufReader::new(read_half), limits),
            writer,
            state: ConnectionState::Connected,
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        self.send_raw(&request.encode()).await
    }

    /// Write bytes as-is, for exercising malformed input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        if let Err(e) = self.writer.write_all(bytes).await {
            self.state = ConnectionState::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }

    /// Next message from the server.
    pub async fn recv(&mut self) -> Result<Response, ClientError> {
        match self.frames.next_response().await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                self.state = ConnectionState::Disconnected;
                Err(ClientError::Closed)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.state = ConnectionState::Disconnected;
                }
                Err(e.into())
            }
        }
    }

    /// [`SyncClient::recv`] bounded by `limit`.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Response, ClientError> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Send `request` and return the next message.
    ///
    /// Only meaningful when no UPDATEs can arrive in between.
    pub async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.send(request).await?;
        self.recv().await
    }

    pub async fn create(&mut self, name: &str, password: &str) -> Result<Response, ClientError> {
        self.request(&Request::Create {
            name: name.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// JOIN and decode the snapshot. A `JOIN FAIL` comes back as
    /// [`ClientError::Unexpected`].
    pub async fn join(&mut self, name: &str, password: &str) -> Result<JoinedDocument, ClientError> {
        let response = self
            .request(&Request::Join {
                name: name.to_string(),
                password: password.to_string(),
            })
            .await?;
        match response {
            Response::JoinOk {
                name,
                version,
                snapshot,
            } => Ok(JoinedDocument {
                name,
                version,
                cells: decode_spreadsheet(&snapshot)?,
            }),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    pub async fn change(
        &mut self,
        name: &str,
        version: u64,
        cell: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        self.send(&Request::Change {
            name: name.to_string(),
            version,
            cell: cell.to_string(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn undo(&mut self, name: &str, version: u64) -> Result<(), ClientError> {
        self.send(&Request::Undo {
            name: name.to_string(),
            version,
        })
        .await
    }

    pub async fn save(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(&Request::Save {
            name: name.to_string(),
        })
        .await
    }

    pub async fn leave(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(&Request::Leave {
            name: name.to_string(),
        })
        .await
    }

    /// Shut down the write side; the server treats this as a disconnect.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.state = ConnectionState::Disconnected;
        self.writer.shutdown().await?;
        Ok(())
    }
}
