//! # High-Level Node API
//!
//! A [`Node`] wires the QUIC transport, the gossip router and a persistence
//! backend into one handle.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//! node.bootstrap(&peer_identity_hex, "203.0.113.7:4433").await?;
//!
//! node.create_forum("general", "my-token").await?;
//! node.join("general").await?;
//! node.post_message("general", "ana", "hello").await?;
//!
//! let mut events = node.events().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::GossipError;
use crate::identity::{Identity, Keypair};
use crate::messages::{Forum, Message};
use crate::protocols::{LocalTopics, Persistence};
use crate::router::{GossipRouter, NodeEvent};
use crate::storage::MemoryStore;
use crate::transport::QuicTransport;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    keypair: Keypair,
    transport: Arc<QuicTransport>,
    router: GossipRouter,
    topics: Arc<LocalTopics>,
    events: TakeOnce<NodeEvent>,
    listener: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Ephemeral node: fresh identity, in-memory storage, default tuning.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::open(
            addr,
            Keypair::generate(),
            Arc::new(MemoryStore::new()),
            NodeConfig::default(),
        )
        .await
    }

    pub async fn open(
        addr: &str,
        keypair: Keypair,
        persistence: Arc<dyn Persistence>,
        config: NodeConfig,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let identity = keypair.identity();

        let (transport_tx, transport_rx) = mpsc::channel(config.event_buffer.max(1));
        let transport = QuicTransport::bind(addr, &keypair, &config, transport_tx)?;
        let local_addr = transport.local_addr()?;

        let topics = Arc::new(LocalTopics::new());
        let (router, events) = GossipRouter::spawn(
            identity,
            persistence,
            topics.clone(),
            &config,
            transport_rx,
        );
        let listener = transport.spawn_accept_loop();

        info!("Node {}/{}", local_addr, identity);

        Ok(Self {
            keypair,
            transport,
            router,
            topics,
            events: tokio::sync::Mutex::new(Some(events)),
            listener,
        })
    }

    /// Hex-encoded identity, as used in bootstrap strings.
    pub fn identity(&self) -> String {
        self.keypair.identity().to_hex()
    }

    pub fn peer_identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn topics(&self) -> &LocalTopics {
        &self.topics
    }

    pub fn router(&self) -> &GossipRouter {
        &self.router
    }

    /// Connect to a peer given its hex identity and socket address.
    pub async fn bootstrap(&self, identity: &str, addr: &str) -> Result<()> {
        let peer = Identity::from_hex(identity)
            .context("invalid identity: must be 64 hex characters")?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address {}", addr))?;
        self.transport.dial(peer, addr).await?;
        Ok(())
    }

    pub async fn create_forum(&self, name: &str, token: &str) -> Result<Forum, GossipError> {
        self.router.create_forum(name, token).await
    }

    /// Post with the forum's own token attached.
    pub async fn post_message(&self, forum: &str, author: &str, body: &str) -> Result<Message, GossipError> {
        self.router.post_message(forum, author, body, None).await
    }

    pub async fn request_history(&self, forum: &str) -> Result<(), GossipError> {
        self.router.request_history(forum).await
    }

    pub async fn join(&self, forum: &str) -> Result<Forum, GossipError> {
        self.router.join(forum).await
    }

    pub async fn leave(&self) -> Option<Forum> {
        self.router.leave().await
    }

    pub async fn active_forum(&self) -> Option<Forum> {
        self.router.active_forum().await
    }

    pub async fn forums(&self) -> Vec<Forum> {
        self.router.forums().await
    }

    pub async fn messages(&self, forum: &str) -> Vec<Message> {
        self.router.messages(forum).await
    }

    pub async fn peers(&self) -> Vec<Identity> {
        self.router.peers().await
    }

    /// UI event stream. Can be taken once.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    pub async fn shutdown(&self) {
        self.listener.abort();
        self.router.quit().await;
        self.transport.close();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.keypair.identity())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
