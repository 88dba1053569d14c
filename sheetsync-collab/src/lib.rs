//! # sheetsync-collab: Collaborative spreadsheet server
//!
//! Clients edit shared spreadsheets over a line-oriented TCP protocol.
//! The server is the single authority for each document's cells and its
//! version counter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    TCP, text     ┌──────────────┐
//! │ SyncClient  │ ◄──────────────► │ SheetServer  │
//! │ (per user)  │  length-prefixed │ (gateway)    │
//! └─────────────┘     payloads     └──────┬───────┘
//!                                         │
//!                                         ▼
//!                                 ┌──────────────────┐    ┌───────────┐
//!                                 │ SessionDirectory │───►│ Catalog   │
//!                                 └────────┬─────────┘    └───────────┘
//!                                          │ one actor per open document
//!                                          ▼
//!                                 ┌──────────────────┐    ┌──────────────┐
//!                                 │ Session          │───►│ XmlFileStore │
//!                                 │ cells · undo · v │    └──────────────┘
//!                                 └────────┬─────────┘
//!                                          ▼
//!                                 ┌──────────────────┐
//!                                 │ BroadcastGroup   │
//!                                 │ (fan-out)        │
//!                                 └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Text wire protocol (requests, responses, frame reader)
//! - [`session`]: Per-document state machine and its actor
//! - [`directory`]: Session lookup, creation and teardown
//! - [`broadcast`]: Ordered fan-out to subscribed connections
//! - [`storage`]: Catalog plus XML document persistence
//! - [`server`]: TCP gateway
//! - [`client`]: TCP client
//!
//! Versions are not persisted: every session starts at version 0, also
//! after a restart.

pub mod broadcast;
pub mod cells;
pub mod client;
pub mod directory;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod undo;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame, Outbox};
pub use cells::CellStore;
pub use client::{ClientError, ConnectionState, JoinedDocument, SyncClient};
pub use directory::{DirectoryError, SessionDirectory};
pub use protocol::{FrameLimits, FrameReader, ProtocolError, Request, Response};
pub use server::{ServerConfig, ServerError, ServerStats, SheetServer};
pub use session::{
    ChangeOutcome, Presence, Session, SessionError, SessionHandle, SessionStats, UndoOutcome,
};
pub use storage::{
    Catalog, CatalogError, Document, DocumentStore, MemoryStore, StoreError, XmlFileStore,
};
pub use undo::{UndoEntry, UndoLog};
