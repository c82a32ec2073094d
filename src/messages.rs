//! # Data Model and Wire Envelopes
//!
//! Forums, messages and the gossip envelopes that carry them between peers.
//!
//! ## Envelope Types
//!
//! | `type` | Fields | Purpose |
//! |--------|--------|---------|
//! | `directory_sync` | `forums` | Push forum directory entries |
//! | `chat` | `forum`, `message` | Deliver one new message |
//! | `request_history` | `forum` | Ask peers for a forum's log |
//! | `sync_messages` | `forum`, `messages` | Answer with (part of) a log |
//!
//! Every envelope carries a unique `id` used for flood deduplication.
//!
//! ## Encoding
//!
//! One envelope is one JSON object with `type` as the tag. Unknown fields are
//! ignored, and an unknown `type` decodes to
//! [`GossipError::UnknownEnvelopeType`] so newer peers can add envelope kinds
//! without older peers treating them as garbage.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GossipError;
use crate::identity::now_ms;

/// Maximum forum name length in bytes.
pub const MAX_FORUM_NAME_LENGTH: usize = 64;

/// Maximum author name length in characters.
pub const MAX_AUTHOR_LENGTH: usize = 30;

/// Maximum message body length in bytes. Enforced on local posts and on
/// merged remote messages.
pub const MAX_BODY_LENGTH: usize = 2000;

/// Maximum length in bytes of a forum or message token.
pub const MAX_TOKEN_LENGTH: usize = 128;

/// Maximum messages per `sync_messages` envelope. Batches are also cut by
/// encoded size, see [`Envelope::sync_batches`].
pub const SYNC_BATCH_SIZE: usize = 200;

const ENVELOPE_TYPES: [&str; 4] = ["directory_sync", "chat", "request_history", "sync_messages"];

/// Check a forum name: non-empty, bounded, printable, no surrounding whitespace.
#[inline]
pub fn is_valid_forum_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FORUM_NAME_LENGTH
        && name.trim() == name
        && !name.chars().any(char::is_control)
}

#[inline]
pub fn is_valid_author(author: &str) -> bool {
    let trimmed = author.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= MAX_AUTHOR_LENGTH
}

/// Fresh forum id: 16 random bytes, hex-encoded.
pub fn new_forum_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fresh envelope or message id (random UUID).
pub fn new_envelope_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forum {
    pub id: String,
    pub name: String,
    /// Opaque token supplied by the creator. Not a signature.
    pub creator_token: String,
    /// Unix milliseconds, advisory.
    pub created_at: u64,
}

impl Forum {
    pub fn new(name: impl Into<String>, creator_token: impl Into<String>) -> Self {
        Self {
            id: new_forum_id(),
            name: name.into(),
            creator_token: creator_token.into(),
            created_at: now_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Name of the forum this message belongs to.
    pub forum: String,
    pub author: String,
    pub body: String,
    /// Opaque per-forum token copied from the forum. Not validated.
    pub token: String,
    /// Unix milliseconds; orders the log.
    pub timestamp: u64,
}

impl Message {
    pub fn new(
        forum: impl Into<String>,
        author: impl Into<String>,
        body: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            id: new_envelope_id(),
            forum: forum.into(),
            author: author.into(),
            body: body.into(),
            token: token.into(),
            timestamp: now_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    DirectorySync {
        id: String,
        forums: Vec<Forum>,
    },
    Chat {
        id: String,
        forum: String,
        message: Message,
    },
    RequestHistory {
        id: String,
        forum: String,
    },
    SyncMessages {
        id: String,
        forum: String,
        messages: Vec<Message>,
    },
}

impl Envelope {
    pub fn directory_sync(forums: Vec<Forum>) -> Self {
        Self::DirectorySync {
            id: new_envelope_id(),
            forums,
        }
    }

    /// A chat envelope reuses the message id as its envelope id, so the
    /// dedup cache and the message log agree on what has been seen.
    pub fn chat(message: Message) -> Self {
        Self::Chat {
            id: message.id.clone(),
            forum: message.forum.clone(),
            message,
        }
    }

    pub fn request_history(forum: impl Into<String>) -> Self {
        Self::RequestHistory {
            id: new_envelope_id(),
            forum: forum.into(),
        }
    }

    pub fn sync_messages(forum: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::SyncMessages {
            id: new_envelope_id(),
            forum: forum.into(),
            messages,
        }
    }

    /// Split a directory into `directory_sync` envelopes whose encoding
    /// fits in `max_frame_size` bytes. An empty directory still yields one
    /// envelope.
    pub fn directory_batches(forums: &[Forum], max_frame_size: usize) -> Vec<Self> {
        let overhead = Self::directory_sync(Vec::new()).encoded_len();
        pack(forums, max_frame_size.saturating_sub(overhead), usize::MAX)
            .into_iter()
            .map(Self::directory_sync)
            .collect()
    }

    /// Split a full log into `sync_messages` envelopes of at most
    /// [`SYNC_BATCH_SIZE`] messages, each encoding to at most
    /// `max_frame_size` bytes. An empty log still yields one envelope.
    pub fn sync_batches(forum: &str, messages: &[Message], max_frame_size: usize) -> Vec<Self> {
        let overhead = Self::sync_messages(forum, Vec::new()).encoded_len();
        pack(messages, max_frame_size.saturating_sub(overhead), SYNC_BATCH_SIZE)
            .into_iter()
            .map(|batch| Self::sync_messages(forum, batch))
            .collect()
    }

    fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }

    pub fn id(&self) -> &str {
        match self {
            Self::DirectorySync { id, .. }
            | Self::Chat { id, .. }
            | Self::RequestHistory { id, .. }
            | Self::SyncMessages { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DirectorySync { .. } => "directory_sync",
            Self::Chat { .. } => "chat",
            Self::RequestHistory { .. } => "request_history",
            Self::SyncMessages { .. } => "sync_messages",
        }
    }

    pub fn forum(&self) -> Option<&str> {
        match self {
            Self::DirectorySync { .. } => None,
            Self::Chat { forum, .. }
            | Self::RequestHistory { forum, .. }
            | Self::SyncMessages { forum, .. } => Some(forum),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, GossipError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode one envelope from a transport frame.
    ///
    /// Errors: [`GossipError::UnknownEnvelopeType`] for a JSON object whose
    /// `type` is not recognized, [`GossipError::MalformedPayload`] for
    /// everything else that does not fit the envelope shape.
    pub fn decode(bytes: &[u8]) -> Result<Self, GossipError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        let kind = value
            .as_object()
            .ok_or_else(|| GossipError::MalformedPayload("envelope is not an object".into()))?
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| GossipError::MalformedPayload("envelope has no type".into()))?;

        if !ENVELOPE_TYPES.contains(&kind) {
            return Err(GossipError::UnknownEnvelopeType(kind.to_string()));
        }

        let envelope: Envelope = serde_json::from_value(value)?;
        if envelope.id().is_empty() {
            return Err(GossipError::MalformedPayload("envelope id is empty".into()));
        }
        Ok(envelope)
    }
}

/// Greedily group `items` so each group's encoded elements, plus one
/// separator byte per element, fit in `budget`. Items that cannot fit on
/// their own are skipped. Always returns at least one (possibly empty) group.
fn pack<T: Serialize + Clone>(items: &[T], budget: usize, max_items: usize) -> Vec<Vec<T>> {
    let mut groups = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut used = 0usize;

    for item in items {
        let size = serde_json::to_vec(item)
            .map_or(usize::MAX, |bytes| bytes.len())
            .saturating_add(1);
        if size > budget {
            warn!(bytes = size, budget, "entry too large for any frame, not sent");
            continue;
        }
        if !current.is_empty() && (used + size > budget || current.len() >= max_items) {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(item.clone());
        used += size;
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }
    groups
}
