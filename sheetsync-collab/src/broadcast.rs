//! Fan-out of encoded frames to the connections subscribed to one session.
//!
//! Each connection owns an ordered outbound queue drained by its writer
//! task. A session only ever holds the sending half, keyed by
//! [`ConnectionId`], so it never touches a socket. Because one session
//! pushes every frame from inside a single actor turn, each subscriber sees
//! UPDATEs in exactly the session's commit order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// An encoded frame, shared between all recipients of a broadcast.
pub type Frame = Arc<Vec<u8>>;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Opaque identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames handed to an outbound queue.
    pub messages_sent: u64,
    /// Frames addressed to a connection whose queue was already closed.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Subscriber set of one session.
///
/// Owned by the session actor, so no locking is needed here.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Outbox>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `peer`. Returns `false` (and replaces the outbox) if it
    /// was already subscribed.
    pub fn add_peer(&mut self, peer: ConnectionId, outbox: Outbox) -> bool {
        self.peers.insert(peer, outbox).is_none()
    }

    pub fn remove_peer(&mut self, peer: &ConnectionId) -> Option<Outbox> {
        self.peers.remove(peer)
    }

    /// Queue `frame` for a single peer.
    pub fn send_to(&mut self, peer: &ConnectionId, frame: Frame) -> bool {
        let delivered = self
            .peers
            .get(peer)
            .is_some_and(|outbox| outbox.send(frame).is_ok());
        self.record(delivered);
        delivered
    }

    /// Queue `frame` for every peer except `origin`.
    ///
    /// Returns the number of peers it was queued for.
    pub fn broadcast_except(&mut self, origin: &ConnectionId, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;
        for (peer, outbox) in &self.peers {
            if peer == origin {
                continue;
            }
            if outbox.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        self.messages_sent += delivered as u64;
        self.messages_dropped += dropped;
        delivered
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn has_peer(&self, peer: &ConnectionId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }

    fn record(&mut self, delivered: bool) {
        if delivered {
            self.messages_sent += 1;
        } else {
            self.messages_dropped += 1;
        }
    }
}
