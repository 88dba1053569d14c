//! Process-wide map of live sessions, keyed by document name.
//!
//! ```text
//! JOIN ──► Catalog::authenticate ──► sessions (RwLock)
//!                                      │ hit, actor alive ──► SessionHandle
//!                                      │ miss / stale     ──► spawn actor (id n+1)
//!                                      ▼
//!                          SessionHandle::join (outside the lock)
//!                                      │ Closed ──► drop entry if id matches, retry
//! ```
//!
//! The map lock covers check-then-create only; it is never held while
//! waiting on a session actor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::broadcast::{ConnectionId, Outbox};
use crate::session::{Presence, SessionError, SessionHandle, SessionStats};
use crate::storage::{Catalog, CatalogError, Document, DocumentStore};

/// How often a join retries after racing with a session teardown.
const MAX_JOIN_ATTEMPTS: usize = 8;

/// Directory errors. The `Display` text is what clients see in FAIL replies.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Unavailable(String),
}

pub struct SessionDirectory {
    catalog: Arc<Catalog>,
    store: Arc<dyn DocumentStore>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionDirectory {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            catalog,
            store,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Register a new empty document.
    pub async fn create_document(&self, name: &str, password: &str) -> Result<Document, DirectoryError> {
        Ok(self.catalog.create(name, password, self.store.as_ref()).await?)
    }

    /// Authenticate and subscribe `conn` to the document's session, starting
    /// one if none is live. Returns the handle and the version sent in
    /// `JOIN OK`.
    pub async fn join(
        &self,
        name: &str,
        password: &str,
        conn: ConnectionId,
        outbox: Outbox,
    ) -> Result<(SessionHandle, u64), DirectoryError> {
        let document = self.catalog.authenticate(name, password).await?;

        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let handle = self.session_handle(&document).await;
            match handle.join(conn, outbox.clone()).await {
                Ok(version) => return Ok((handle, version)),
                Err(SessionError::Closed) => {
                    log::debug!(
                        "Session {} for {name:?} closed under join (attempt {attempt})",
                        handle.id()
                    );
                    self.remove_if_current(&handle).await;
                }
                Err(e) => {
                    self.remove_if_current(&handle).await;
                    return Err(DirectoryError::Unavailable(e.to_string()));
                }
            }
        }

        log::warn!("Giving up joining {name:?} after {MAX_JOIN_ATTEMPTS} attempts");
        Err(DirectoryError::Unavailable(format!(
            "Session for {name} is shutting down."
        )))
    }

    /// Unsubscribe `conn`; the last leave tears the session down.
    pub async fn leave(&self, handle: &SessionHandle, conn: ConnectionId) -> Presence {
        // An actor that is already gone has no subscribers left
        let presence = handle.leave(conn).await.unwrap_or(Presence::NowEmpty);
        if presence == Presence::NowEmpty {
            self.remove_if_current(handle).await;
        }
        presence
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Live session for `name`, if any.
    pub async fn session_for(&self, name: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(name)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn stats(&self) -> Vec<SessionStats> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        futures_util::future::join_all(handles.iter().map(|handle| handle.stats()))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Flush every live session. Returns how many were saved.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let results = futures_util::future::join_all(handles.iter().map(|handle| handle.flush())).await;

        let mut saved = 0;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(true) => saved += 1,
                Ok(false) | Err(SessionError::Closed) => {}
                Err(e) => log::error!("Flushing {:?} on shutdown failed: {e}", handle.document().name),
            }
        }
        log::info!("Shutdown flushed {saved} of {} sessions", handles.len());
        saved
    }

    async fn session_handle(&self, document: &Document) -> SessionHandle {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&document.name) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&document.name) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle::spawn(id, document.clone(), self.store.clone());
        sessions.insert(document.name.clone(), handle.clone());
        log::info!("Session {id} created for {:?}", document.name);
        handle
    }

    async fn remove_if_current(&self, handle: &SessionHandle) -> bool {
        let name = &handle.document().name;
        let mut sessions = self.sessions.write().await;
        if sessions.get(name).is_some_and(|h| h.id() == handle.id()) {
            sessions.remove(name);
            log::info!("Session {} for {name:?} destroyed", handle.id());
            return true;
        }
        false
    }
}
