//! Collaborator traits at the edges of the gossip core.
//!
//! The router owns all forum state but never touches a disk or a socket
//! directly. It talks to three collaborators:
//!
//! | Collaborator | Interface | Shipped implementations |
//! |--------------|-----------|-------------------------|
//! | Persistence | [`Persistence`] | [`JsonFileStore`](crate::storage::JsonFileStore), [`MemoryStore`](crate::storage::MemoryStore) |
//! | Topic membership | [`TopicMembership`] | [`LocalTopics`] |
//! | Transport | [`TransportEvent`] stream + [`PeerLink`] handles | [`QuicTransport`](crate::transport::QuicTransport) |
//!
//! Keeping these as traits lets the multi-peer tests run several routers
//! against in-memory links without binding sockets.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;

use crate::crypto::TopicKey;
use crate::identity::Identity;
use crate::messages::{Forum, Message};
use crate::registry::{ConnectionId, PeerLink};

/// Synchronous key → collection storage.
///
/// Reads of a missing collection return an empty one. A failed write leaves
/// the router's in-memory state untouched; the next successful write of the
/// same collection carries the full state again.
pub trait Persistence: Send + Sync {
    fn load_directory(&self) -> Result<Vec<Forum>>;

    fn save_directory(&self, forums: &[Forum]) -> Result<()>;

    fn load_messages(&self, forum: &str) -> Result<Vec<Message>>;

    fn save_messages(&self, forum: &str, messages: &[Message]) -> Result<()>;
}

/// Announces which rendezvous topics this node is interested in.
///
/// The session joins the active forum's [`TopicKey`] and leaves it on switch.
/// [`QuicTransport`](crate::transport::QuicTransport) does not read topics:
/// gossip reaches every connected peer regardless of membership. The hook is
/// for a discovery layer that wants to find peers by forum.
pub trait TopicMembership: Send + Sync {
    fn join_topic(&self, topic: TopicKey);

    fn leave_topic(&self, topic: TopicKey);
}

/// Topic membership tracked in-process.
///
/// Peers are connected explicitly (bootstrap or `/connect`), so membership is
/// bookkeeping only: it records what the session has joined.
#[derive(Debug, Default)]
pub struct LocalTopics {
    joined: Mutex<HashSet<TopicKey>>,
}

impl LocalTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joined(&self) -> Vec<TopicKey> {
        self.joined
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, topic: &TopicKey) -> bool {
        self.joined
            .lock()
            .map(|set| set.contains(topic))
            .unwrap_or(false)
    }
}

impl TopicMembership for LocalTopics {
    fn join_topic(&self, topic: TopicKey) {
        if let Ok(mut set) = self.joined.lock()
            && set.insert(topic)
        {
            tracing::debug!(topic = %topic, "joined topic");
        }
    }

    fn leave_topic(&self, topic: TopicKey) {
        if let Ok(mut set) = self.joined.lock()
            && set.remove(&topic)
        {
            tracing::debug!(topic = %topic, "left topic");
        }
    }
}

/// Connection lifecycle and inbound data, as reported by a transport.
///
/// Every event names the connection it belongs to so the router can ignore
/// traffic from a connection it did not register.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer connection completed its handshake. `link` writes to it.
    Connected { peer: Identity, link: PeerLink },
    /// One complete frame arrived.
    Data {
        peer: Identity,
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    /// The connection ended cleanly or was closed by either side.
    Closed {
        peer: Identity,
        connection: ConnectionId,
    },
    /// The connection failed. It is closed afterwards.
    Error {
        peer: Identity,
        connection: ConnectionId,
        error: String,
    },
}
