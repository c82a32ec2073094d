//! Error taxonomy for the gossip core.
//!
//! Nothing here is fatal: the worst outcome of a bad input is a dropped
//! envelope or a disconnected peer. The router logs the inbound variants
//! at different levels (see [`GossipError::is_silent`]); local actions
//! return them to the caller.

use crate::identity::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// Envelope or collection could not be parsed into a recognized shape.
    MalformedPayload(String),
    /// Well-formed envelope with a `type` this node does not understand.
    UnknownEnvelopeType(String),
    /// Envelope id already recorded by the dedup cache.
    DuplicateEnvelope(String),
    /// Writing to a peer failed; the peer has been unregistered.
    PeerWriteFailure(Identity),
    /// The persistence collaborator rejected a write. In-memory state is kept.
    PersistenceFailure(String),
    /// A forum with this name already exists in the local directory.
    ForumExists(String),
    /// No forum with this name is known locally.
    UnknownForum(String),
    /// Name or body rejected by local validation.
    InvalidInput(String),
    /// The router task has stopped.
    RouterClosed,
}

impl GossipError {
    /// Drops that are part of normal protocol operation and need no log line
    /// above `trace`.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Self::UnknownEnvelopeType(_) | Self::DuplicateEnvelope(_)
        )
    }
}

impl std::fmt::Display for GossipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload(reason) => write!(f, "malformed payload: {}", reason),
            Self::UnknownEnvelopeType(kind) => write!(f, "unknown envelope type {:?}", kind),
            Self::DuplicateEnvelope(id) => write!(f, "duplicate envelope {}", id),
            Self::PeerWriteFailure(peer) => write!(f, "write to peer {} failed", peer.short()),
            Self::PersistenceFailure(reason) => write!(f, "persistence failure: {}", reason),
            Self::ForumExists(name) => write!(f, "forum {:?} already exists", name),
            Self::UnknownForum(name) => write!(f, "forum {:?} not found", name),
            Self::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            Self::RouterClosed => write!(f, "gossip router closed"),
        }
    }
}

impl std::error::Error for GossipError {}

impl From<serde_json::Error> for GossipError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPayload(e.to_string())
    }
}
