//! One live spreadsheet session and the actor that serialises access to it.
//!
//! ```text
//!  conn A ──┐                      ┌──────────── session actor ───────────┐
//!  conn B ──┼─ SessionCommand ──►  │ CellStore · UndoLog · version        │
//!  conn C ──┘   (mpsc, in order)   │ BroadcastGroup ──► per-conn outboxes │
//!                                  └──────────────────────────────────────┘
//!                   ◄── oneshot ack (outcome) after replies are queued
//! ```
//!
//! Every command is handled to completion inside one actor turn: the reply
//! to the submitter and the UPDATE fan-out to the other subscribers are both
//! queued before the next command is taken. That gives a total order of
//! versions per document, and every subscriber sees UPDATEs in that order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Outbox};
use crate::cells::CellStore;
use crate::protocol::Response;
use crate::storage::{encode_spreadsheet, Document, DocumentStore, StoreError};
use crate::undo::UndoLog;

/// Result of a CHANGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Accepted { version: u64 },
    /// The client was behind; nothing changed.
    Stale { current: u64 },
}

/// Result of an UNDO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// `cell` was restored to `content`.
    Reverted {
        cell: String,
        content: String,
        version: u64,
    },
    Stale { current: u64 },
    /// Nothing left to undo since the last save.
    Exhausted { current: u64 },
}

/// Subscriber state after a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    StillActive { subscribers: usize },
    /// The last subscriber left; the session is being torn down.
    NowEmpty,
}

/// Snapshot of a session's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub document: String,
    pub version: u64,
    pub cells: usize,
    pub pending_changes: usize,
    pub subscribers: usize,
    /// Successful saves since the session was opened.
    pub saves: u64,
    pub broadcast: BroadcastStats,
}

/// Errors seen by callers of a [`SessionHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The actor has stopped. A join should retry with a fresh session.
    #[error("session closed")]
    Closed,

    /// The document could not be loaded.
    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// In-memory state of one open document.
pub struct Session {
    document: Document,
    cells: CellStore,
    undo: UndoLog,
    version: u64,
    peers: BroadcastGroup,
    store: Arc<dyn DocumentStore>,
    saves: u64,
}

impl Session {
    pub fn new(document: Document, cells: CellStore, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            document,
            cells,
            undo: UndoLog::new(),
            version: 0,
            peers: BroadcastGroup::new(),
            store,
            saves: 0,
        }
    }

    /// Load the persisted cells for `document`. The version starts at 0.
    pub fn open(document: Document, store: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let cells = store.load(&document.path)?;
        log::info!(
            "Opened {:?} from {} ({} cells)",
            document.name,
            document.path.display(),
            cells.len()
        );
        Ok(Self::new(document, cells, store))
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cells(&self) -> &CellStore {
        &self.cells
    }

    pub fn pending_changes(&self) -> usize {
        self.undo.len()
    }

    pub fn subscribers(&self) -> usize {
        self.peers.peer_count()
    }

    /// Subscribe `conn` and queue `JOIN OK` with the full cell set.
    pub fn join(&mut self, conn: ConnectionId, outbox: Outbox) -> Result<u64, StoreError> {
        let snapshot = encode_spreadsheet(&self.cells)?;
        if !self.peers.add_peer(conn, outbox) {
            log::warn!("Connection {conn} joined {:?} twice", self.document.name);
        }
        self.reply(
            &conn,
            Response::JoinOk {
                name: self.document.name.clone(),
                version: self.version,
                snapshot,
            },
        );
        log::debug!(
            "{conn} joined {:?} at version {} ({} subscribers)",
            self.document.name,
            self.version,
            self.peers.peer_count()
        );
        Ok(self.version)
    }

    /// Apply a CHANGE submitted against `version`.
    pub fn apply_change(
        &mut self,
        conn: &ConnectionId,
        version: u64,
        cell: String,
        content: String,
    ) -> ChangeOutcome {
        if version != self.version {
            log::debug!(
                "{conn}: stale CHANGE on {:?} (sent {version}, at {})",
                self.document.name,
                self.version
            );
            self.reply(
                conn,
                Response::ChangeWait {
                    name: self.document.name.clone(),
                    version: self.version,
                },
            );
            return ChangeOutcome::Stale {
                current: self.version,
            };
        }

        let prior = self.cells.set(cell.clone(), content.clone());
        self.undo.push(cell.clone(), prior);
        self.version += 1;

        self.reply(
            conn,
            Response::ChangeOk {
                name: self.document.name.clone(),
                version: self.version,
            },
        );
        self.broadcast_update(conn, cell, content);
        ChangeOutcome::Accepted {
            version: self.version,
        }
    }

    /// Revert the most recent unsaved change.
    pub fn undo(&mut self, conn: &ConnectionId, version: u64) -> UndoOutcome {
        let name = self.document.name.clone();
        if version != self.version {
            self.reply(
                conn,
                Response::UndoWait {
                    name,
                    version: self.version,
                },
            );
            return UndoOutcome::Stale {
                current: self.version,
            };
        }

        let Some(entry) = self.undo.pop_last() else {
            self.reply(
                conn,
                Response::UndoEnd {
                    name,
                    version: self.version,
                },
            );
            return UndoOutcome::Exhausted {
                current: self.version,
            };
        };

        self.cells.set(entry.cell.clone(), entry.prior.clone());
        self.version += 1;

        self.broadcast_update(conn, entry.cell.clone(), entry.prior.clone());
        self.reply(
            conn,
            Response::UndoOk {
                name,
                version: self.version,
                cell: entry.cell.clone(),
                content: entry.prior.clone(),
            },
        );
        UndoOutcome::Reverted {
            cell: entry.cell,
            content: entry.prior,
            version: self.version,
        }
    }

    /// Overwrite the persisted document and clear the undo log.
    ///
    /// On failure nothing in memory changes.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.store.save(&self.document.path, &self.cells)?;
        self.undo.clear();
        self.saves += 1;
        log::debug!(
            "Saved {:?} to {} at version {}",
            self.document.name,
            self.document.path.display(),
            self.version
        );
        Ok(())
    }

    /// Save on behalf of `conn`, replying `SAVE OK` or `SAVE FAIL`.
    pub fn request_save(&mut self, conn: &ConnectionId) -> Result<(), StoreError> {
        let name = self.document.name.clone();
        match self.save() {
            Ok(()) => {
                self.reply(conn, Response::SaveOk { name });
                Ok(())
            }
            Err(e) => {
                log::error!("Saving {name:?} failed: {e}");
                self.reply(
                    conn,
                    Response::SaveFail {
                        name,
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Save only if there are unsaved changes. Returns whether a save happened.
    pub fn flush(&mut self) -> Result<bool, StoreError> {
        if self.undo.is_empty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Unsubscribe `conn`. The last leave flushes pending changes.
    pub fn leave(&mut self, conn: &ConnectionId) -> Presence {
        if self.peers.remove_peer(conn).is_none() {
            log::debug!("{conn} left {:?} without being subscribed", self.document.name);
        }

        if !self.peers.is_empty() {
            return Presence::StillActive {
                subscribers: self.peers.peer_count(),
            };
        }

        match self.flush() {
            Ok(true) => log::info!("Flushed {:?} on last leave", self.document.name),
            Ok(false) => {}
            Err(e) => log::error!(
                "Flushing {:?} on last leave failed, {} changes lost: {e}",
                self.document.name,
                self.undo.len()
            ),
        }
        Presence::NowEmpty
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            document: self.document.name.clone(),
            version: self.version,
            cells: self.cells.len(),
            pending_changes: self.undo.len(),
            subscribers: self.peers.peer_count(),
            saves: self.saves,
            broadcast: self.peers.stats(),
        }
    }

    fn reply(&mut self, conn: &ConnectionId, response: Response) {
        if !self.peers.send_to(conn, response.frame()) {
            log::debug!("{conn}: dropped {} (not subscribed)", response.header());
        }
    }

    fn broadcast_update(&mut self, origin: &ConnectionId, cell: String, content: String) {
        let update = Response::Update {
            name: self.document.name.clone(),
            version: self.version,
            cell,
            content,
        };
        let sent = self.peers.broadcast_except(origin, &update.frame());
        log::debug!(
            "{:?} v{}: UPDATE to {sent} subscribers",
            self.document.name,
            self.version
        );
    }
}

enum SessionCommand {
    Join {
        conn: ConnectionId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Change {
        conn: ConnectionId,
        version: u64,
        cell: String,
        content: String,
        reply: oneshot::Sender<ChangeOutcome>,
    },
    Undo {
        conn: ConnectionId,
        version: u64,
        reply: oneshot::Sender<UndoOutcome>,
    },
    Save {
        conn: ConnectionId,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Leave {
        conn: ConnectionId,
        reply: oneshot::Sender<Presence>,
    },
    Flush {
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Cloneable address of a running session actor.
///
/// `id` distinguishes successive sessions for the same document so the
/// directory never removes an entry that has already been replaced.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    document: Arc<Document>,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("document", &self.document.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Start an actor for `document`. The document is loaded by the actor.
    pub fn spawn(id: u64, document: Document, store: Arc<dyn DocumentStore>) -> Self {
        let document = Arc::new(document);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(id, Document::clone(&document), store, rx));
        Self { id, document, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Whether the actor has stopped taking commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, conn: ConnectionId, outbox: Outbox) -> Result<u64, SessionError> {
        self.request(|reply| SessionCommand::Join {
            conn,
            outbox,
            reply,
        })
        .await?
    }

    pub async fn change(
        &self,
        conn: ConnectionId,
        version: u64,
        cell: String,
        content: String,
    ) -> Result<ChangeOutcome, SessionError> {
        self.request(|reply| SessionCommand::Change {
            conn,
            version,
            cell,
            content,
            reply,
        })
        .await
    }

    pub async fn undo(&self, conn: ConnectionId, version: u64) -> Result<UndoOutcome, SessionError> {
        self.request(|reply| SessionCommand::Undo {
            conn,
            version,
            reply,
        })
        .await
    }

    pub async fn save(&self, conn: ConnectionId) -> Result<(), SessionError> {
        Ok(self
            .request(|reply| SessionCommand::Save { conn, reply })
            .await??)
    }

    pub async fn leave(&self, conn: ConnectionId) -> Result<Presence, SessionError> {
        self.request(|reply| SessionCommand::Leave { conn, reply })
            .await
    }

    pub async fn flush(&self) -> Result<bool, SessionError> {
        Ok(self.request(|reply| SessionCommand::Flush { reply }).await??)
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

async fn run_session(
    id: u64,
    document: Document,
    store: Arc<dyn DocumentStore>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let name = document.name.clone();
    let mut session = match Session::open(document, store) {
        Ok(session) => session,
        Err(e) => {
            log::error!("Session {id}: cannot load {name:?}: {e}");
            let reason = e.to_string();
            commands.close();
            while let Some(command) = commands.recv().await {
                if let SessionCommand::Join { reply, .. } = command {
                    let _ = reply.send(Err(SessionError::Unavailable(reason.clone())));
                }
            }
            return;
        }
    };
    log::info!("Session {id} started for {name:?}");

    let mut emptied = false;
    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Join {
                conn,
                outbox,
                reply,
            } => {
                let _ = reply.send(session.join(conn, outbox).map_err(SessionError::from));
            }
            SessionCommand::Change {
                conn,
                version,
                cell,
                content,
                reply,
            } => {
                let _ = reply.send(session.apply_change(&conn, version, cell, content));
            }
            SessionCommand::Undo {
                conn,
                version,
                reply,
            } => {
                let _ = reply.send(session.undo(&conn, version));
            }
            SessionCommand::Save { conn, reply } => {
                let _ = reply.send(session.request_save(&conn));
            }
            SessionCommand::Leave { conn, reply } => {
                let presence = session.leave(&conn);
                let _ = reply.send(presence);
                if presence == Presence::NowEmpty {
                    emptied = true;
                    break;
                }
            }
            SessionCommand::Flush { reply } => {
                let _ = reply.send(session.flush());
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(session.stats());
            }
        }
    }

    // Every handle dropped while subscribers remained (server shutdown).
    // The last leave has already made its one save attempt.
    if !emptied {
        if let Err(e) = session.flush() {
            log::error!("Session {id}: final flush of {name:?} failed: {e}");
        }
    }
    log::info!("Session {id} for {name:?} closed at version {}", session.version());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Frame;
    use crate::storage::MemoryStore;
    use std::path::PathBuf;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PATH: &str = "budget.xml";

    fn budget() -> Document {
        Document {
            name: "budget".into(),
            password: "pw".into(),
            path: PathBuf::from(PATH),
        }
    }

    fn open(store: &Arc<MemoryStore>) -> Session {
        if store.document(PATH.as_ref()).is_none() {
            store.insert(PATH, CellStore::new());
        }
        Session::open(budget(), store.clone()).unwrap()
    }

    fn subscribe(session: &mut Session) -> (ConnectionId, UnboundedReceiver<Frame>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        session.join(conn, tx).unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| frame.to_vec())
            .collect()
    }

    fn update(version: u64, cell: &str, content: &str) -> Vec<u8> {
        Response::Update {
            name: "budget".into(),
            version,
            cell: cell.into(),
            content: content.into(),
        }
        .encode()
    }

    #[test]
    fn test_join_sends_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, [("A1", "5")].into_iter().collect());
        let mut session = open(&store);
        let (_, mut rx) = subscribe(&mut session);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let expected = Response::JoinOk {
            name: "budget".into(),
            version: 0,
            snapshot: encode_spreadsheet(session.cells()).unwrap(),
        };
        assert_eq!(frames[0], expected.encode());
    }

    #[test]
    fn test_budget_scenario() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (c1, mut rx1) = subscribe(&mut session);
        let (_c2, mut rx2) = subscribe(&mut session);
        drain(&mut rx1);
        drain(&mut rx2);

        let outcome = session.apply_change(&c1, 0, "A1".into(), "5".into());
        assert_eq!(outcome, ChangeOutcome::Accepted { version: 1 });
        assert_eq!(
            drain(&mut rx1),
            vec![Response::ChangeOk {
                name: "budget".into(),
                version: 1
            }
            .encode()]
        );
        assert_eq!(drain(&mut rx2), vec![update(1, "A1", "5")]);

        let outcome = session.undo(&c1, 1);
        assert_eq!(
            outcome,
            UndoOutcome::Reverted {
                cell: "A1".into(),
                content: String::new(),
                version: 2
            }
        );
        assert_eq!(
            drain(&mut rx1),
            vec![Response::UndoOk {
                name: "budget".into(),
                version: 2,
                cell: "A1".into(),
                content: String::new()
            }
            .encode()]
        );
        assert_eq!(drain(&mut rx2), vec![update(2, "A1", "")]);
        assert!(!session.cells().contains("A1"));
    }

    #[test]
    fn test_stale_change_does_not_mutate() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, mut rx) = subscribe(&mut session);
        let (_other, mut other_rx) = subscribe(&mut session);
        for (v, cell) in ["A1", "A2", "A3"].into_iter().enumerate() {
            session.apply_change(&conn, v as u64, cell.into(), "1".into());
        }
        drain(&mut rx);
        drain(&mut other_rx);
        let before = session.cells().clone();

        let outcome = session.apply_change(&conn, 2, "B1".into(), "x".into());
        assert_eq!(outcome, ChangeOutcome::Stale { current: 3 });
        assert_eq!(session.cells(), &before);
        assert_eq!(session.version(), 3);
        assert_eq!(session.pending_changes(), 3);
        assert_eq!(
            drain(&mut rx),
            vec![Response::ChangeWait {
                name: "budget".into(),
                version: 3
            }
            .encode()]
        );
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn test_undo_to_absence_then_end() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, mut rx) = subscribe(&mut session);

        session.apply_change(&conn, 0, "A1".into(), "5".into());
        assert!(matches!(session.undo(&conn, 1), UndoOutcome::Reverted { .. }));
        assert_eq!(session.cells().get("A1"), "");
        drain(&mut rx);

        let before = session.cells().clone();
        assert_eq!(session.undo(&conn, 2), UndoOutcome::Exhausted { current: 2 });
        assert_eq!(session.cells(), &before);
        assert_eq!(session.version(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![Response::UndoEnd {
                name: "budget".into(),
                version: 2
            }
            .encode()]
        );
    }

    #[test]
    fn test_undo_stale_version() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, _rx) = subscribe(&mut session);
        session.apply_change(&conn, 0, "A1".into(), "5".into());

        assert_eq!(session.undo(&conn, 0), UndoOutcome::Stale { current: 1 });
        assert_eq!(session.cells().get("A1"), "5");
        assert_eq!(session.pending_changes(), 1);
    }

    #[test]
    fn test_undo_restores_overwritten_content() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, [("A1", "old")].into_iter().collect());
        let mut session = open(&store);
        let (conn, _rx) = subscribe(&mut session);

        session.apply_change(&conn, 0, "A1".into(), "new".into());
        session.apply_change(&conn, 1, "A1".into(), "".into());
        assert!(!session.cells().contains("A1"));

        session.undo(&conn, 2);
        assert_eq!(session.cells().get("A1"), "new");
        session.undo(&conn, 3);
        assert_eq!(session.cells().get("A1"), "old");
        assert_eq!(session.undo(&conn, 4), UndoOutcome::Exhausted { current: 4 });
    }

    #[test]
    fn test_version_counts_accepted_operations() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, _rx) = subscribe(&mut session);

        let mut accepted = 0;
        for i in 0..20u64 {
            if i % 3 == 2 {
                if let UndoOutcome::Reverted { .. } = session.undo(&conn, session.version()) {
                    accepted += 1;
                }
            } else {
                session.apply_change(&conn, session.version(), format!("A{i}"), i.to_string());
                accepted += 1;
            }
            // Stale attempts never count
            session.apply_change(&conn, session.version() + 1, "Z9".into(), "x".into());
        }
        assert_eq!(session.version(), accepted);
    }

    #[test]
    fn test_save_then_reload() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, mut rx) = subscribe(&mut session);
        session.apply_change(&conn, 0, "A1".into(), "5".into());
        session.apply_change(&conn, 1, "B2".into(), "two\nlines".into());
        drain(&mut rx);

        session.request_save(&conn).unwrap();
        assert_eq!(session.pending_changes(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![Response::SaveOk {
                name: "budget".into()
            }
            .encode()]
        );

        let reloaded = Session::open(budget(), store.clone()).unwrap();
        assert_eq!(reloaded.cells(), session.cells());
        assert_eq!(reloaded.pending_changes(), 0);
        assert_eq!(reloaded.version(), 0);
    }

    #[test]
    fn test_failed_save_keeps_undo_log() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, mut rx) = subscribe(&mut session);
        session.apply_change(&conn, 0, "A1".into(), "5".into());
        drain(&mut rx);

        store.set_fail_saves(true);
        assert!(session.request_save(&conn).is_err());
        assert_eq!(session.pending_changes(), 1);
        assert_eq!(session.cells().get("A1"), "5");

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"SAVE FAIL\nName:budget\n"));

        store.set_fail_saves(false);
        assert!(session.flush().unwrap());
        assert_eq!(session.pending_changes(), 0);
    }

    #[test]
    fn test_last_leave_saves_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (c1, _rx1) = subscribe(&mut session);
        let (c2, _rx2) = subscribe(&mut session);
        session.apply_change(&c1, 0, "A1".into(), "5".into());

        assert_eq!(session.leave(&c1), Presence::StillActive { subscribers: 1 });
        assert_eq!(store.save_count(), 0);
        assert_eq!(session.leave(&c2), Presence::NowEmpty);
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.document(PATH.as_ref()).unwrap().get("A1"), "5");
    }

    #[test]
    fn test_last_leave_without_changes_skips_save() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, _rx) = subscribe(&mut session);
        session.apply_change(&conn, 0, "A1".into(), "5".into());
        session.save().unwrap();

        assert_eq!(session.leave(&conn), Presence::NowEmpty);
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_last_leave_with_failing_store_still_empties() {
        let store = Arc::new(MemoryStore::new());
        let mut session = open(&store);
        let (conn, _rx) = subscribe(&mut session);
        session.apply_change(&conn, 0, "A1".into(), "5".into());
        store.set_fail_saves(true);

        assert_eq!(session.leave(&conn), Presence::NowEmpty);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_closes_after_last_leave() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, CellStore::new());
        let handle = SessionHandle::spawn(1, budget(), store.clone());

        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(handle.join(conn, tx).await.unwrap(), 0);
        assert_eq!(
            handle.change(conn, 0, "A1".into(), "5".into()).await.unwrap(),
            ChangeOutcome::Accepted { version: 1 }
        );

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.version, 1);
        assert_eq!(stats.pending_changes, 1);
        assert_eq!(stats.subscribers, 1);

        assert_eq!(handle.leave(conn).await.unwrap(), Presence::NowEmpty);
        assert_eq!(store.save_count(), 1);

        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            handle.join(ConnectionId::new(), tx).await,
            Err(SessionError::Closed)
        ));
        assert!(handle.is_closed());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_handle_last_leave_saves_once_when_store_fails() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, CellStore::new());
        let handle = SessionHandle::spawn(3, budget(), store.clone());
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.join(conn, tx).await.unwrap();
        handle.change(conn, 0, "A1".into(), "5".into()).await.unwrap();

        store.set_fail_saves(true);
        assert_eq!(handle.leave(conn).await.unwrap(), Presence::NowEmpty);
        for _ in 0..100 {
            if handle.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(handle.is_closed());
        assert_eq!(store.failed_save_count(), 1);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_debug_names_document() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, CellStore::new());
        let handle = SessionHandle::spawn(5, budget(), store);
        let shown = format!("{handle:?}");
        assert!(shown.contains("id: 5"));
        assert!(shown.contains("budget"));
    }

    #[tokio::test]
    async fn test_handle_save_reports_failure() {
        let store = Arc::new(MemoryStore::new());
        store.insert(PATH, CellStore::new());
        let handle = SessionHandle::spawn(1, budget(), store.clone());
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.join(conn, tx).await.unwrap();
        handle.change(conn, 0, "A1".into(), "5".into()).await.unwrap();

        store.set_fail_saves(true);
        assert!(matches!(handle.save(conn).await, Err(SessionError::Store(_))));
        store.set_fail_saves(false);
        handle.save(conn).await.unwrap();
        assert!(!handle.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_load_failure_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let handle = SessionHandle::spawn(7, budget(), store);

        let (tx, _rx) = mpsc::unbounded_channel();
        match handle.join(ConnectionId::new(), tx).await {
            Err(SessionError::Unavailable(reason)) => assert!(reason.contains("budget.xml")),
            // The actor may have finished draining before the join arrived
            Err(SessionError::Closed) => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
