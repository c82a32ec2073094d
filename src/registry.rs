//! # Peer Registry
//!
//! Directly connected peers, one live connection per identity.
//!
//! A [`PeerLink`] is the write side of a connection: a bounded queue drained
//! by the transport's writer task. Writes never block the router. A full or
//! closed queue counts as a failed write and the peer is unregistered.
//!
//! Each link carries the [`ConnectionId`] the transport assigned. When a peer
//! dials twice, the second connection is refused registration; because events
//! name their connection, a later close of the refused connection cannot
//! remove the registered one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::Identity;

/// Transport-assigned, process-unique connection number.
pub type ConnectionId = u64;

/// One encoded envelope, shared across every peer it is sent to.
pub type Frame = Arc<[u8]>;

/// Write handle for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

impl PeerLink {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self { id, tx }
    }

    /// In-memory link for harnesses: the receiver sees every queued frame.
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting. Fails when the queue is full or the
    /// writer has gone away.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<Identity, PeerLink>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link` for `peer`. Returns `false` and leaves the existing
    /// link in place if the peer is already registered.
    pub fn register(&mut self, peer: Identity, link: PeerLink) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        debug!(peer = %peer.short(), connection = link.id(), "peer registered");
        self.peers.insert(peer, link);
        true
    }

    pub fn unregister(&mut self, peer: &Identity) -> Option<PeerLink> {
        let removed = self.peers.remove(peer);
        if removed.is_some() {
            debug!(peer = %peer.short(), "peer unregistered");
        }
        removed
    }

    /// Unregister `peer` only if its registered link is `connection`.
    pub fn unregister_connection(&mut self, peer: &Identity, connection: ConnectionId) -> bool {
        if self.is_current(peer, connection) {
            self.unregister(peer);
            true
        } else {
            false
        }
    }

    pub fn is_current(&self, peer: &Identity, connection: ConnectionId) -> bool {
        self.peers.get(peer).is_some_and(|link| link.id() == connection)
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.peers.contains_key(peer)
    }

    /// Directed write. A failed write unregisters the peer and returns `false`.
    pub fn send(&mut self, peer: &Identity, frame: Frame) -> bool {
        let Some(link) = self.peers.get(peer) else {
            return false;
        };
        if link.try_send(frame) {
            trace!(peer = %peer.short(), "frame queued");
            true
        } else {
            self.unregister(peer);
            false
        }
    }

    /// Write `frame` to every registered peer except `except`.
    ///
    /// A failed write to one peer does not stop delivery to the rest. Peers
    /// whose write failed are unregistered and returned.
    pub fn broadcast(&mut self, frame: &Frame, except: Option<&Identity>) -> Vec<Identity> {
        let mut failed = Vec::new();
        for (peer, link) in &self.peers {
            if Some(peer) == except {
                continue;
            }
            if !link.try_send(Arc::clone(frame)) {
                failed.push(*peer);
            }
        }
        for peer in &failed {
            self.unregister(peer);
        }
        failed
    }

    pub fn peers(&self) -> Vec<Identity> {
        let mut peers: Vec<_> = self.peers.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
