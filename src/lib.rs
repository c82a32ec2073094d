//! # Agora - Serverless Gossip Forums
//!
//! Agora keeps a shared directory of forums and each forum's message log in
//! sync across peers with no central server:
//!
//! - **Identity**: Ed25519 keypairs; the public key is the peer id
//! - **Transport**: mutually authenticated QUIC, one connection per peer
//! - **Gossip**: every envelope is flooded to direct peers and deduplicated by id
//! - **Merge**: forum directories and message logs are unions keyed by id, so
//!   replicas converge regardless of delivery order or repetition
//!
//! ## Architecture
//!
//! The router uses the **Actor Pattern**:
//! - [`GossipRouter`] is a cheap-to-clone handle that sends commands over a channel
//! - a private actor owns the dedup cache, state store, peer registry and
//!   session, and processes commands and transport events sequentially
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining transport, router and storage |
//! | `router` | Envelope handling, flooding, local actions |
//! | `messages` | Forums, messages and wire envelopes |
//! | `store` | In-memory directory and logs with idempotent merges |
//! | `dedup` | Bounded FIFO set of seen envelope ids |
//! | `registry` | Connected peers and their outbound queues |
//! | `session` | The active forum and its topic membership |
//! | `storage` | JSON file and in-memory persistence, user profile |
//! | `transport` | QUIC connections and length-prefixed framing |
//! | `crypto` | TLS certificates, verifiers and topic keys |
//! | `identity` | Keypairs and identities |
//! | `protocols` | Collaborator traits (persistence, topics, transport events) |
//! | `config` | Tuning parameters |
//! | `error` | Gossip error taxonomy |

mod config;
mod crypto;
mod dedup;
mod error;
mod identity;
mod messages;
mod node;
mod protocols;
mod registry;
mod router;
mod session;
mod storage;
mod store;
mod transport;

pub use config::NodeConfig;
pub use crypto::TopicKey;
pub use dedup::{DEFAULT_DEDUP_CAPACITY, DedupCache};
pub use error::GossipError;
pub use identity::{Identity, Keypair};
pub use messages::{
    Envelope, Forum, MAX_AUTHOR_LENGTH, MAX_BODY_LENGTH, MAX_FORUM_NAME_LENGTH, MAX_TOKEN_LENGTH,
    Message, SYNC_BATCH_SIZE, is_valid_author, is_valid_forum_name,
};
pub use node::Node;
pub use protocols::{LocalTopics, Persistence, TopicMembership, TransportEvent};
pub use registry::{ConnectionId, Frame, PeerLink, PeerRegistry};
pub use router::{GossipRouter, NodeEvent};
pub use session::{SessionController, SessionState};
pub use storage::{JsonFileStore, MemoryStore, UserProfile, message_file_name};
pub use store::StateStore;
pub use transport::QuicTransport;
