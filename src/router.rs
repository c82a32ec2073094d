//! # Gossip Router
//!
//! Floods forum directories and message logs between directly connected
//! peers.
//!
//! ## Envelope Handling
//!
//! | Envelope | On receipt |
//! |----------|------------|
//! | `directory_sync` | merge forums; if new ones arrived, persist and relay |
//! | `chat` | merge the message; if new, persist, relay and show it when its forum is active |
//! | `request_history` | answer every peer with the full local log; relay the request |
//! | `sync_messages` | merge; if anything was new, persist, relay and refresh the active view |
//!
//! An envelope whose id is already in the [`DedupCache`] is dropped, so each
//! node handles an envelope id at most once and a flood over a cyclic topology
//! terminates. Ids are recorded once an envelope has been accepted; one that
//! fails validation leaves the cache untouched.
//! Relays go to every registered peer except the one that delivered the
//! envelope, and carry the original bytes unchanged.
//!
//! Envelopes this node builds from its own state (directory pushes, history
//! replies) are split so each frame stays within `max_frame_size`.
//!
//! ## Architecture
//!
//! Handle + Actor. [`GossipRouter`] is a cheap-to-clone handle; the private
//! `RouterActor` owns the dedup cache, the [`StateStore`], the
//! [`PeerRegistry`] and the [`SessionController`], and processes local
//! commands and transport events one at a time from a single task.
//!
//! UI-facing notifications leave through a bounded [`NodeEvent`] channel.
//! The router never waits on it; if the consumer falls behind, events are
//! dropped with a warning.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::dedup::DedupCache;
use crate::error::GossipError;
use crate::identity::Identity;
use crate::messages::{
    Envelope, Forum, MAX_BODY_LENGTH, MAX_TOKEN_LENGTH, Message, is_valid_author,
    is_valid_forum_name,
};
use crate::protocols::{Persistence, TopicMembership, TransportEvent};
use crate::registry::{ConnectionId, Frame, PeerLink, PeerRegistry};
use crate::session::SessionController;
use crate::store::StateStore;

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A new message arrived for the active forum.
    Chat(Message),
    /// The active forum's log grew through a history sync. Carries the full log.
    HistoryUpdated { forum: String, messages: Vec<Message> },
    /// Forums learned from peers.
    DirectoryUpdated { added: Vec<Forum> },
    PeerConnected(Identity),
    PeerDisconnected(Identity),
    /// A write to persistence failed. In-memory state is intact.
    PersistenceWarning { error: String },
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, GossipError>>;

enum Command {
    CreateForum {
        name: String,
        token: String,
        reply: Reply<Forum>,
    },
    PostMessage {
        forum: String,
        author: String,
        body: String,
        token: Option<String>,
        reply: Reply<Message>,
    },
    RequestHistory(String, Reply<()>),
    Join(String, Reply<Forum>),
    Leave(oneshot::Sender<Option<Forum>>),
    Forums(oneshot::Sender<Vec<Forum>>),
    Messages(String, oneshot::Sender<Vec<Message>>),
    Peers(oneshot::Sender<Vec<Identity>>),
    ActiveForum(oneshot::Sender<Option<Forum>>),
    Quit,
}

// ============================================================================
// GossipRouter Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone, Debug)]
pub struct GossipRouter {
    cmd_tx: mpsc::Sender<Command>,
}

impl GossipRouter {
    /// Spawn the router actor.
    ///
    /// `transport_rx` delivers connection events and inbound frames. The
    /// returned receiver yields [`NodeEvent`]s for the UI.
    pub fn spawn(
        local: Identity,
        persistence: Arc<dyn Persistence>,
        topics: Arc<dyn TopicMembership>,
        config: &NodeConfig,
        transport_rx: mpsc::Receiver<TransportEvent>,
    ) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let actor = RouterActor::new(local, persistence, topics, config, event_tx);
        tokio::spawn(actor.run(cmd_rx, transport_rx));

        (Self { cmd_tx }, event_rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, GossipError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| GossipError::RouterClosed)?;
        rx.await.map_err(|_| GossipError::RouterClosed)?
    }

    async fn query<T: Default>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Create a forum and announce it to every peer.
    ///
    /// Fails with [`GossipError::ForumExists`] if the name is already in the
    /// local directory and [`GossipError::InvalidInput`] for an unusable name.
    pub async fn create_forum(&self, name: &str, token: &str) -> Result<Forum, GossipError> {
        let name = name.to_string();
        let token = token.to_string();
        self.request(|reply| Command::CreateForum { name, token, reply })
            .await
    }

    /// Post a message to a known forum and announce it to every peer.
    ///
    /// Without an explicit `token` the forum's creator token is attached.
    pub async fn post_message(
        &self,
        forum: &str,
        author: &str,
        body: &str,
        token: Option<&str>,
    ) -> Result<Message, GossipError> {
        let forum = forum.to_string();
        let author = author.to_string();
        let body = body.to_string();
        let token = token.map(str::to_string);
        self.request(|reply| Command::PostMessage {
            forum,
            author,
            body,
            token,
            reply,
        })
        .await
    }

    /// Ask peers for the log of `forum`. Replies arrive asynchronously as
    /// merges (and, for the active forum, [`NodeEvent::HistoryUpdated`]).
    pub async fn request_history(&self, forum: &str) -> Result<(), GossipError> {
        let forum = forum.to_string();
        self.request(|reply| Command::RequestHistory(forum, reply)).await
    }

    /// Make `forum` the active forum and pull its history.
    pub async fn join(&self, forum: &str) -> Result<Forum, GossipError> {
        let forum = forum.to_string();
        self.request(|reply| Command::Join(forum, reply)).await
    }

    pub async fn leave(&self) -> Option<Forum> {
        self.query(Command::Leave).await
    }

    pub async fn forums(&self) -> Vec<Forum> {
        self.query(Command::Forums).await
    }

    pub async fn messages(&self, forum: &str) -> Vec<Message> {
        let forum = forum.to_string();
        self.query(|reply| Command::Messages(forum, reply)).await
    }

    pub async fn peers(&self) -> Vec<Identity> {
        self.query(Command::Peers).await
    }

    pub async fn active_forum(&self) -> Option<Forum> {
        self.query(Command::ActiveForum).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Router Actor (owns state)
// ============================================================================

struct RouterActor {
    local: Identity,
    dedup: DedupCache,
    store: StateStore,
    registry: PeerRegistry,
    session: SessionController,
    event_tx: mpsc::Sender<NodeEvent>,
    max_frame_size: usize,
}

impl RouterActor {
    fn new(
        local: Identity,
        persistence: Arc<dyn Persistence>,
        topics: Arc<dyn TopicMembership>,
        config: &NodeConfig,
        event_tx: mpsc::Sender<NodeEvent>,
    ) -> Self {
        Self {
            local,
            dedup: DedupCache::new(config.dedup_capacity),
            store: StateStore::load(persistence),
            registry: PeerRegistry::new(),
            session: SessionController::new(topics),
            event_tx,
            max_frame_size: config.max_frame_size,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut transport_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::CreateForum { name, token, reply }) => {
                            let _ = reply.send(self.handle_create_forum(&name, &token));
                        }
                        Some(Command::PostMessage { forum, author, body, token, reply }) => {
                            let _ = reply.send(self.handle_post_message(&forum, &author, &body, token));
                        }
                        Some(Command::RequestHistory(forum, reply)) => {
                            let _ = reply.send(self.handle_request_history(&forum));
                        }
                        Some(Command::Join(forum, reply)) => {
                            let _ = reply.send(self.handle_join(&forum));
                        }
                        Some(Command::Leave(reply)) => {
                            let left = self.session.leave();
                            if let Some(forum) = &left {
                                info!(forum = %forum.name, "left forum");
                            }
                            let _ = reply.send(left);
                        }
                        Some(Command::Forums(reply)) => {
                            let _ = reply.send(self.store.snapshot_directory());
                        }
                        Some(Command::Messages(forum, reply)) => {
                            let _ = reply.send(self.store.snapshot_messages(&forum));
                        }
                        Some(Command::Peers(reply)) => {
                            let _ = reply.send(self.registry.peers());
                        }
                        Some(Command::ActiveForum(reply)) => {
                            let _ = reply.send(self.session.active().cloned());
                        }
                        Some(Command::Quit) => {
                            debug!("router actor quitting");
                            break;
                        }
                        None => {
                            debug!("router handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                event = transport_rx.recv(), if transport_open => {
                    match event {
                        Some(event) => self.handle_transport_event(event),
                        None => {
                            debug!("transport event channel closed");
                            transport_open = false;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, link } => self.handle_connected(peer, link),
            TransportEvent::Data {
                peer,
                connection,
                bytes,
            } => {
                if !self.registry.is_current(&peer, connection) {
                    trace!(peer = %peer.short(), connection, "frame from unregistered connection dropped");
                    return;
                }
                if let Err(e) = self.handle_inbound(peer, bytes) {
                    if e.is_silent() {
                        trace!(peer = %peer.short(), "{}", e);
                    } else {
                        debug!(peer = %peer.short(), "envelope dropped: {}", e);
                    }
                }
            }
            TransportEvent::Closed { peer, connection } => {
                self.handle_disconnected(peer, connection);
            }
            TransportEvent::Error {
                peer,
                connection,
                error,
            } => {
                warn!(peer = %peer.short(), connection, error = %error, "connection error");
                self.handle_disconnected(peer, connection);
            }
        }
    }

    fn handle_connected(&mut self, peer: Identity, link: PeerLink) {
        if peer == self.local {
            debug!("ignoring connection to self");
            return;
        }
        let connection = link.id();
        if !self.registry.register(peer, link) {
            debug!(peer = %peer.short(), connection, "duplicate connection rejected");
            return;
        }
        info!(peer = %peer.short(), "peer connected");
        self.emit(NodeEvent::PeerConnected(peer));

        let directory = self.store.snapshot_directory();
        for envelope in Envelope::directory_batches(&directory, self.max_frame_size) {
            let frame = match self.encode_originated(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode directory");
                    return;
                }
            };
            if !self.registry.send(&peer, frame) {
                debug!("{}", GossipError::PeerWriteFailure(peer));
                self.emit(NodeEvent::PeerDisconnected(peer));
                return;
            }
        }
    }

    fn handle_disconnected(&mut self, peer: Identity, connection: ConnectionId) {
        if self.registry.unregister_connection(&peer, connection) {
            info!(peer = %peer.short(), "peer disconnected");
            self.emit(NodeEvent::PeerDisconnected(peer));
        }
    }

    fn handle_inbound(&mut self, from: Identity, bytes: Vec<u8>) -> Result<(), GossipError> {
        let envelope = Envelope::decode(&bytes)?;
        if self.dedup.contains(envelope.id()) {
            return Err(GossipError::DuplicateEnvelope(envelope.id().to_string()));
        }
        trace!(peer = %from.short(), kind = envelope.kind(), id = envelope.id(), "envelope received");

        let id = envelope.id().to_string();
        self.apply_inbound(from, envelope, Arc::from(bytes))?;
        self.dedup.observe(&id);
        Ok(())
    }

    fn apply_inbound(&mut self, from: Identity, envelope: Envelope, frame: Frame) -> Result<(), GossipError> {
        match envelope {
            Envelope::DirectorySync { forums, .. } => {
                let mut added: Vec<Forum> = Vec::new();
                for forum in &forums {
                    if !self.store.contains_id(&forum.id) && !added.iter().any(|f| f.id == forum.id) {
                        added.push(forum.clone());
                    }
                }
                if !self.store.merge_directory(&forums)? {
                    return Ok(());
                }
                debug!(count = added.len(), "forums learned");
                self.persist_directory();
                self.fan_out(&frame, Some(&from));
                self.emit(NodeEvent::DirectoryUpdated { added });
            }
            Envelope::Chat { forum, message, .. } => {
                if !self.store.merge_messages(&forum, std::slice::from_ref(&message))? {
                    return Ok(());
                }
                self.persist_messages(&forum);
                self.fan_out(&frame, Some(&from));
                if self.session.surfaces(&forum) {
                    self.emit(NodeEvent::Chat(message));
                }
            }
            Envelope::RequestHistory { forum, .. } => {
                let log = self.store.snapshot_messages(&forum);
                debug!(forum = %forum, count = log.len(), "answering history request");
                for batch in Envelope::sync_batches(&forum, &log, self.max_frame_size) {
                    let reply = self.encode_originated(&batch)?;
                    self.fan_out(&reply, None);
                }
                self.fan_out(&frame, Some(&from));
            }
            Envelope::SyncMessages { forum, messages, .. } => {
                if !self.store.merge_messages(&forum, &messages)? {
                    return Ok(());
                }
                self.persist_messages(&forum);
                self.fan_out(&frame, Some(&from));
                if self.session.surfaces(&forum) {
                    let messages = self.store.snapshot_messages(&forum);
                    self.emit(NodeEvent::HistoryUpdated { forum, messages });
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------------

    fn handle_create_forum(&mut self, name: &str, token: &str) -> Result<Forum, GossipError> {
        if !is_valid_forum_name(name) {
            return Err(GossipError::InvalidInput(format!("bad forum name {:?}", name)));
        }
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(GossipError::InvalidInput(format!(
                "token must be at most {} bytes",
                MAX_TOKEN_LENGTH
            )));
        }
        if self.store.contains_name(name) {
            return Err(GossipError::ForumExists(name.to_string()));
        }

        let forum = Forum::new(name, token);
        self.store.merge_directory(std::slice::from_ref(&forum))?;
        self.persist_directory();
        self.originate(&Envelope::directory_sync(vec![forum.clone()]))?;
        info!(forum = %forum.name, id = %forum.id, "forum created");
        Ok(forum)
    }

    fn handle_post_message(
        &mut self,
        forum: &str,
        author: &str,
        body: &str,
        token: Option<String>,
    ) -> Result<Message, GossipError> {
        let known = self
            .store
            .forum_by_name(forum)
            .ok_or_else(|| GossipError::UnknownForum(forum.to_string()))?;
        if !is_valid_author(author) {
            return Err(GossipError::InvalidInput(format!("bad author {:?}", author)));
        }
        let body = body.trim();
        if body.is_empty() || body.len() > MAX_BODY_LENGTH {
            return Err(GossipError::InvalidInput(format!(
                "message body must be 1..={} bytes",
                MAX_BODY_LENGTH
            )));
        }

        let token = token.unwrap_or_else(|| known.creator_token.clone());
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(GossipError::InvalidInput(format!(
                "token must be at most {} bytes",
                MAX_TOKEN_LENGTH
            )));
        }
        let message = Message::new(forum, author.trim(), body, token);
        self.store
            .merge_messages(forum, std::slice::from_ref(&message))?;
        self.persist_messages(forum);
        self.originate(&Envelope::chat(message.clone()))?;
        if self.session.surfaces(forum) {
            self.emit(NodeEvent::Chat(message.clone()));
        }
        Ok(message)
    }

    fn handle_request_history(&mut self, forum: &str) -> Result<(), GossipError> {
        if forum.is_empty() {
            return Err(GossipError::InvalidInput("empty forum name".into()));
        }
        self.originate(&Envelope::request_history(forum))?;
        debug!(forum = %forum, peers = self.registry.len(), "history requested");
        Ok(())
    }

    fn handle_join(&mut self, name: &str) -> Result<Forum, GossipError> {
        let forum = self
            .store
            .forum_by_name(name)
            .cloned()
            .ok_or_else(|| GossipError::UnknownForum(name.to_string()))?;
        self.session.join(forum.clone());
        info!(forum = %forum.name, "joined forum");
        self.handle_request_history(&forum.name)?;
        Ok(forum)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Encode an envelope this node created and mark its id as seen, so the
    /// copies flooded back to us are dropped.
    fn encode_originated(&mut self, envelope: &Envelope) -> Result<Frame, GossipError> {
        let bytes = envelope.encode()?;
        self.dedup.observe(envelope.id());
        Ok(Arc::from(bytes))
    }

    fn originate(&mut self, envelope: &Envelope) -> Result<(), GossipError> {
        let frame = self.encode_originated(envelope)?;
        self.fan_out(&frame, None);
        Ok(())
    }

    fn fan_out(&mut self, frame: &Frame, except: Option<&Identity>) {
        for peer in self.registry.broadcast(frame, except) {
            debug!("{}", GossipError::PeerWriteFailure(peer));
            self.emit(NodeEvent::PeerDisconnected(peer));
        }
    }

    fn persist_directory(&mut self) {
        if let Err(e) = self.store.persist_directory() {
            warn!(error = %e, "directory not saved");
            self.emit(NodeEvent::PersistenceWarning { error: e.to_string() });
        }
    }

    fn persist_messages(&mut self, forum: &str) {
        if let Err(e) = self.store.persist_messages(forum) {
            warn!(forum = %forum, error = %e, "messages not saved");
            self.emit(NodeEvent::PersistenceWarning { error: e.to_string() });
        }
    }

    fn emit(&self, event: NodeEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => warn!("event channel full, event dropped"),
                mpsc::error::TrySendError::Closed(_) => trace!("event receiver gone"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::LocalTopics;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    struct Harness {
        router: GossipRouter,
        events: mpsc::Receiver<NodeEvent>,
        transport_tx: mpsc::Sender<TransportEvent>,
        store: Arc<MemoryStore>,
    }

    fn spawn_router() -> Harness {
        spawn_router_with(&NodeConfig::default())
    }

    fn spawn_router_with(config: &NodeConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (router, events) = GossipRouter::spawn(
            Keypair::generate().identity(),
            store.clone(),
            Arc::new(LocalTopics::new()),
            config,
            transport_rx,
        );
        Harness {
            router,
            events,
            transport_tx,
            store,
        }
    }

    async fn connect(h: &Harness, id: ConnectionId) -> (Identity, mpsc::Receiver<Frame>) {
        let peer = Keypair::generate().identity();
        let (link, rx) = PeerLink::channel(id, 64);
        h.transport_tx
            .send(TransportEvent::Connected { peer, link })
            .await
            .unwrap();
        (peer, rx)
    }

    async fn deliver(h: &Harness, peer: Identity, connection: ConnectionId, envelope: &Envelope) {
        h.transport_tx
            .send(TransportEvent::Data {
                peer,
                connection,
                bytes: envelope.encode().unwrap(),
            })
            .await
            .unwrap();
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<Frame>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed");
        Envelope::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn create_forum_rejects_duplicates_and_bad_names() {
        let h = spawn_router();
        let forum = h.router.create_forum("general", "tok").await.unwrap();
        assert_eq!(forum.name, "general");

        assert_eq!(
            h.router.create_forum("general", "other").await,
            Err(GossipError::ForumExists("general".into()))
        );
        assert!(matches!(
            h.router.create_forum("", "tok").await,
            Err(GossipError::InvalidInput(_))
        ));
        assert_eq!(h.router.forums().await, vec![forum]);
    }

    #[tokio::test]
    async fn new_peer_receives_full_directory() {
        let h = spawn_router();
        h.router.create_forum("general", "tok").await.unwrap();

        let (_peer, mut rx) = connect(&h, 1).await;
        match next_envelope(&mut rx).await {
            Envelope::DirectorySync { forums, .. } => assert_eq!(forums[0].name, "general"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn post_requires_known_forum() {
        let h = spawn_router();
        assert_eq!(
            h.router.post_message("nowhere", "ana", "hi", None).await,
            Err(GossipError::UnknownForum("nowhere".into()))
        );
        assert!(matches!(
            h.router.join("nowhere").await,
            Err(GossipError::UnknownForum(_))
        ));
    }

    #[tokio::test]
    async fn posted_message_carries_forum_token() {
        let h = spawn_router();
        h.router.create_forum("general", "secret").await.unwrap();
        let message = h.router.post_message("general", "ana", " hello ", None).await.unwrap();

        assert_eq!(message.token, "secret");
        assert_eq!(message.body, "hello");
        assert_eq!(h.router.messages("general").await, vec![message]);
    }

    #[tokio::test]
    async fn request_history_answers_every_peer_and_relays() {
        let h = spawn_router();
        h.router.create_forum("general", "tok").await.unwrap();
        h.router.post_message("general", "ana", "one", None).await.unwrap();

        let (asker, mut rx_asker) = connect(&h, 1).await;
        let (_other, mut rx_other) = connect(&h, 2).await;
        next_envelope(&mut rx_asker).await;
        next_envelope(&mut rx_other).await;

        let request = Envelope::request_history("general");
        h.transport_tx
            .send(TransportEvent::Data {
                peer: asker,
                connection: 1,
                bytes: request.encode().unwrap(),
            })
            .await
            .unwrap();

        match next_envelope(&mut rx_asker).await {
            Envelope::SyncMessages { messages, .. } => assert_eq!(messages.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(next_envelope(&mut rx_other).await, Envelope::SyncMessages { .. }));
        assert_eq!(next_envelope(&mut rx_other).await.id(), request.id());
    }

    #[tokio::test]
    async fn persistence_failure_is_a_warning() {
        let mut h = spawn_router();
        h.store.set_failing(true);

        let forum = h.router.create_forum("general", "tok").await.unwrap();
        assert_eq!(h.router.forums().await, vec![forum]);

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NodeEvent::PersistenceWarning { .. }));
    }

    #[tokio::test]
    async fn frames_from_rejected_connection_are_ignored() {
        let h = spawn_router();
        let peer = Keypair::generate().identity();
        let (first, _rx1) = PeerLink::channel(1, 8);
        let (second, _rx2) = PeerLink::channel(2, 8);
        h.transport_tx
            .send(TransportEvent::Connected { peer, link: first })
            .await
            .unwrap();
        h.transport_tx
            .send(TransportEvent::Connected { peer, link: second })
            .await
            .unwrap();

        let forum = Forum::new("sneaky", "tok");
        h.transport_tx
            .send(TransportEvent::Data {
                peer,
                connection: 2,
                bytes: Envelope::directory_sync(vec![forum]).encode().unwrap(),
            })
            .await
            .unwrap();
        h.transport_tx
            .send(TransportEvent::Closed { peer, connection: 2 })
            .await
            .unwrap();

        // Transport events are handled in order: once the marker forum sent
        // on the registered connection shows up, everything above is done.
        let marker = Forum::new("marker", "tok");
        h.transport_tx
            .send(TransportEvent::Data {
                peer,
                connection: 1,
                bytes: Envelope::directory_sync(vec![marker.clone()]).encode().unwrap(),
            })
            .await
            .unwrap();

        let forums = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let forums = h.router.forums().await;
                if !forums.is_empty() {
                    return forums;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(forums, vec![marker]);
        assert_eq!(h.router.peers().await, vec![peer]);
    }

    #[tokio::test]
    async fn handle_reports_closed_router() {
        let h = spawn_router();
        h.router.quit().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            h.router.create_forum("general", "tok").await,
            Err(GossipError::RouterClosed)
        );
        assert!(h.router.forums().await.is_empty());
    }

    #[tokio::test]
    async fn history_reply_respects_frame_limit() {
        const LIMIT: usize = 8 * 1024;
        let h = spawn_router_with(&NodeConfig {
            max_frame_size: LIMIT,
            ..NodeConfig::default()
        });
        h.router.create_forum("general", "tok").await.unwrap();
        let body = "x".repeat(MAX_BODY_LENGTH - 500);
        for _ in 0..20 {
            h.router.post_message("general", "ana", &body, None).await.unwrap();
        }

        let (asker, mut rx) = connect(&h, 1).await;
        next_envelope(&mut rx).await;
        deliver(&h, asker, 1, &Envelope::request_history("general")).await;

        let mut received = 0;
        let mut frames = 0;
        while received < 20 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for history")
                .expect("link closed");
            assert!(frame.len() <= LIMIT, "frame of {} bytes", frame.len());
            match Envelope::decode(&frame).unwrap() {
                Envelope::SyncMessages { messages, .. } => received += messages.len(),
                other => panic!("unexpected {:?}", other),
            }
            frames += 1;
        }
        assert_eq!(received, 20);
        assert!(frames > 1);
    }

    #[tokio::test]
    async fn chat_for_unknown_forum_is_not_stored() {
        let h = spawn_router();
        h.router.create_forum("general", "tok").await.unwrap();
        let (peer, mut rx) = connect(&h, 1).await;
        next_envelope(&mut rx).await;

        let ghost = Message::new("ghost", "bob", "boo", "tok");
        deliver(&h, peer, 1, &Envelope::chat(ghost)).await;

        let marker = Message::new("general", "bob", "marker", "tok");
        deliver(&h, peer, 1, &Envelope::chat(marker.clone())).await;

        // Transport events are handled in order: once the marker is merged,
        // the ghost chat has been handled too.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while h.router.messages("general").await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "marker never merged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.router.messages("general").await, vec![marker]);
        assert!(h.router.messages("ghost").await.is_empty());
        assert!(h.store.load_messages("ghost").unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_envelope_does_not_consume_its_id() {
        let h = spawn_router();
        h.router.create_forum("general", "tok").await.unwrap();
        let (peer, mut rx) = connect(&h, 1).await;
        next_envelope(&mut rx).await;

        let message = Message::new("general", "bob", "hello", "tok");
        let mut oversized = message.clone();
        oversized.body = "x".repeat(MAX_BODY_LENGTH + 1);
        let bad = Envelope::Chat {
            id: message.id.clone(),
            forum: "general".into(),
            message: oversized,
        };
        deliver(&h, peer, 1, &bad).await;
        deliver(&h, peer, 1, &Envelope::chat(message.clone())).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while h.router.messages("general").await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "valid copy was dropped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.router.messages("general").await, vec![message]);
    }

    #[tokio::test]
    async fn connection_error_unregisters_peer() {
        let mut h = spawn_router();
        let (peer, mut rx) = connect(&h, 1).await;
        next_envelope(&mut rx).await;
        assert_eq!(h.router.peers().await, vec![peer]);

        h.transport_tx
            .send(TransportEvent::Error {
                peer,
                connection: 1,
                error: "write timeout".into(),
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !h.router.peers().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "peer still registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok()).collect();
        assert!(events.contains(&NodeEvent::PeerDisconnected(peer)));
    }
}
