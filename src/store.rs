//! # Forum State Store
//!
//! In-memory forum directory and per-forum message logs, backed by a
//! [`Persistence`] collaborator.
//!
//! ## Merge Semantics
//!
//! Both merges are set unions keyed by id, so applying the same remote
//! collection any number of times yields the same state:
//!
//! - **Directory**: forums are added when their id is unknown. Two forums with
//!   the same name but different ids are both kept.
//! - **Messages**: unseen message ids are appended, then the log is stably
//!   sorted by timestamp. Messages with equal timestamps keep arrival order.
//!
//! A remote collection is validated as a whole before anything is applied; a
//! single bad entry rejects the batch with [`GossipError::MalformedPayload`].
//! Remote entries are held to the same size limits as local ones.
//!
//! Messages are only merged into forums present in the directory. A log for
//! any other name is refused with [`GossipError::UnknownForum`], so the set of
//! logs held in memory and on disk is bounded by the directory.
//!
//! ## Persistence
//!
//! The directory is loaded eagerly by [`StateStore::load`]. A forum's log is
//! loaded on first access. Merges only touch memory; the router calls
//! `persist_*` afterwards and treats failures as warnings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::error::GossipError;
use crate::messages::{
    Forum, MAX_AUTHOR_LENGTH, MAX_BODY_LENGTH, MAX_FORUM_NAME_LENGTH, MAX_TOKEN_LENGTH, Message,
};
use crate::protocols::Persistence;

#[derive(Debug, Default)]
struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    fn from_messages(stored: Vec<Message>) -> Self {
        let mut log = Self::default();
        for message in stored {
            if log.ids.insert(message.id.clone()) {
                log.messages.push(message);
            }
        }
        log.messages.sort_by_key(|m| m.timestamp);
        log
    }
}

pub struct StateStore {
    directory: Vec<Forum>,
    forum_ids: HashSet<String>,
    logs: HashMap<String, MessageLog>,
    persistence: Arc<dyn Persistence>,
}

impl StateStore {
    /// Empty store; nothing is read until [`load`](Self::load) or first access.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            directory: Vec::new(),
            forum_ids: HashSet::new(),
            logs: HashMap::new(),
            persistence,
        }
    }

    /// Hydrate the directory from persistence.
    ///
    /// A read failure leaves the directory empty and is logged; the node still
    /// starts and will learn forums from its peers.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let mut store = Self::new(persistence);
        match store.persistence.load_directory() {
            Ok(forums) => {
                for forum in forums {
                    if !forum.id.is_empty() && store.forum_ids.insert(forum.id.clone()) {
                        store.directory.push(forum);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load forum directory"),
        }
        store
    }

    /// Union `remote` into the directory. Returns `true` if any forum was added.
    pub fn merge_directory(&mut self, remote: &[Forum]) -> Result<bool, GossipError> {
        for forum in remote {
            if forum.id.is_empty() {
                return Err(GossipError::MalformedPayload("forum with empty id".into()));
            }
            if forum.name.is_empty() || forum.name.len() > MAX_FORUM_NAME_LENGTH {
                return Err(GossipError::MalformedPayload(format!(
                    "forum {} has a name of {} bytes",
                    forum.id,
                    forum.name.len()
                )));
            }
            if forum.creator_token.len() > MAX_TOKEN_LENGTH {
                return Err(GossipError::MalformedPayload(format!(
                    "forum {} has an oversized token",
                    forum.id
                )));
            }
        }

        let mut changed = false;
        for forum in remote {
            if self.forum_ids.insert(forum.id.clone()) {
                self.directory.push(forum.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Union `remote` into the log of `forum`. Returns `true` if any message
    /// was added.
    ///
    /// Fails with [`GossipError::UnknownForum`] when no forum of that name is
    /// in the directory.
    pub fn merge_messages(&mut self, forum: &str, remote: &[Message]) -> Result<bool, GossipError> {
        if forum.is_empty() {
            return Err(GossipError::MalformedPayload("empty forum reference".into()));
        }
        for message in remote {
            validate_message(forum, message)?;
        }
        if !self.contains_name(forum) {
            return Err(GossipError::UnknownForum(forum.to_string()));
        }

        let log = self.log_mut(forum);
        let mut changed = false;
        for message in remote {
            if log.ids.insert(message.id.clone()) {
                log.messages.push(message.clone());
                changed = true;
            }
        }
        if changed {
            log.messages.sort_by_key(|m| m.timestamp);
        }
        Ok(changed)
    }

    pub fn snapshot_directory(&self) -> Vec<Forum> {
        self.directory.clone()
    }

    /// Full log of `forum`, oldest first.
    ///
    /// Only logs of forums in the directory are kept in memory. Any other name
    /// is read straight from persistence, which usually yields an empty log.
    pub fn snapshot_messages(&mut self, forum: &str) -> Vec<Message> {
        if let Some(log) = self.logs.get(forum) {
            return log.messages.clone();
        }
        if self.contains_name(forum) {
            return self.log_mut(forum).messages.clone();
        }
        self.read_log(forum).messages
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.forum_ids.contains(id)
    }

    /// First forum registered under `name`.
    pub fn forum_by_name(&self, name: &str) -> Option<&Forum> {
        self.directory.iter().find(|f| f.name == name)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.forum_by_name(name).is_some()
    }

    pub fn persist_directory(&self) -> Result<(), GossipError> {
        self.persistence
            .save_directory(&self.directory)
            .map_err(|e| GossipError::PersistenceFailure(format!("forum directory: {:#}", e)))
    }

    pub fn persist_messages(&mut self, forum: &str) -> Result<(), GossipError> {
        let persistence = Arc::clone(&self.persistence);
        let log = self.log_mut(forum);
        persistence
            .save_messages(forum, &log.messages)
            .map_err(|e| GossipError::PersistenceFailure(format!("messages of {:?}: {:#}", forum, e)))
    }

    fn read_log(&self, forum: &str) -> MessageLog {
        match self.persistence.load_messages(forum) {
            Ok(messages) => MessageLog::from_messages(messages),
            Err(e) => {
                warn!(forum = %forum, error = %e, "failed to load message log");
                MessageLog::default()
            }
        }
    }

    fn log_mut(&mut self, forum: &str) -> &mut MessageLog {
        if !self.logs.contains_key(forum) {
            let log = self.read_log(forum);
            self.logs.insert(forum.to_string(), log);
        }
        self.logs.entry(forum.to_string()).or_default()
    }
}

fn validate_message(forum: &str, message: &Message) -> Result<(), GossipError> {
    let problem = if message.id.is_empty() {
        "empty id"
    } else if message.forum != forum {
        "belongs to another forum"
    } else if message.body.len() > MAX_BODY_LENGTH {
        "body too long"
    } else if message.author.chars().count() > MAX_AUTHOR_LENGTH {
        "author too long"
    } else if message.token.len() > MAX_TOKEN_LENGTH {
        "token too long"
    } else {
        return Ok(());
    };
    Err(GossipError::MalformedPayload(format!(
        "message {:?} in {:?}: {}",
        message.id, forum, problem
    )))
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("forums", &self.directory.len())
            .field("loaded_logs", &self.logs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> (StateStore, Arc<MemoryStore>) {
        let backing = Arc::new(MemoryStore::new());
        (StateStore::new(backing.clone()), backing)
    }

    /// Store whose directory already holds a forum named "general".
    fn general_store() -> StateStore {
        let (mut store, _) = store();
        store.merge_directory(&[forum("f1", "general")]).unwrap();
        store
    }

    fn forum(id: &str, name: &str) -> Forum {
        Forum {
            id: id.into(),
            name: name.into(),
            creator_token: "tok".into(),
            created_at: 1,
        }
    }

    fn message(id: &str, forum: &str, ts: u64) -> Message {
        Message {
            id: id.into(),
            forum: forum.into(),
            author: "ana".into(),
            body: format!("body {id}"),
            token: "tok".into(),
            timestamp: ts,
        }
    }

    #[test]
    fn directory_merge_is_idempotent() {
        let (mut store, _) = store();
        let remote = vec![forum("f1", "general"), forum("f2", "rust")];

        assert!(store.merge_directory(&remote).unwrap());
        for _ in 0..3 {
            assert!(!store.merge_directory(&remote).unwrap());
        }
        assert_eq!(store.snapshot_directory().len(), 2);
    }

    #[test]
    fn same_name_forums_are_both_kept() {
        let (mut store, _) = store();
        store.merge_directory(&[forum("f1", "general")]).unwrap();
        assert!(store.merge_directory(&[forum("f2", "general")]).unwrap());

        assert_eq!(store.snapshot_directory().len(), 2);
        assert_eq!(store.forum_by_name("general").unwrap().id, "f1");
    }

    #[test]
    fn malformed_directory_leaves_store_unchanged() {
        let (mut store, _) = store();
        let remote = vec![forum("f1", "general"), forum("", "broken")];

        assert!(matches!(
            store.merge_directory(&remote),
            Err(GossipError::MalformedPayload(_))
        ));
        assert!(store.snapshot_directory().is_empty());
    }

    #[test]
    fn log_stays_sorted_without_duplicates() {
        let mut store = general_store();
        store
            .merge_messages("general", &[message("c", "general", 30), message("a", "general", 10)])
            .unwrap();
        store
            .merge_messages(
                "general",
                &[message("b", "general", 20), message("a", "general", 10), message("d", "general", 5)],
            )
            .unwrap();

        let log = store.snapshot_messages("general");
        let ids: Vec<_> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["d", "a", "b", "c"]);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut store = general_store();
        store
            .merge_messages("general", &[message("x", "general", 7), message("y", "general", 7)])
            .unwrap();
        store.merge_messages("general", &[message("z", "general", 7)]).unwrap();

        let ids: Vec<_> = store
            .snapshot_messages("general")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["x", "y", "z"]);
    }

    #[test]
    fn message_merge_is_idempotent() {
        let mut store = general_store();
        let batch = vec![message("a", "general", 1), message("b", "general", 2)];
        assert!(store.merge_messages("general", &batch).unwrap());
        assert!(!store.merge_messages("general", &batch).unwrap());
        assert_eq!(store.snapshot_messages("general").len(), 2);
    }

    #[test]
    fn foreign_message_rejects_whole_batch() {
        let mut store = general_store();
        let batch = vec![message("a", "general", 1), message("b", "rust", 2)];

        assert!(matches!(
            store.merge_messages("general", &batch),
            Err(GossipError::MalformedPayload(_))
        ));
        assert!(store.snapshot_messages("general").is_empty());
    }

    #[test]
    fn logs_load_lazily_from_persistence() {
        let backing = Arc::new(MemoryStore::new());
        backing
            .save_messages("general", &[message("old", "general", 1)])
            .unwrap();
        backing.save_directory(&[forum("f1", "general")]).unwrap();

        let mut store = StateStore::load(backing.clone());
        assert!(store.contains_name("general"));

        assert!(store.merge_messages("general", &[message("new", "general", 2)]).unwrap());
        let ids: Vec<_> = store
            .snapshot_messages("general")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["old", "new"]);
    }

    #[test]
    fn persistence_failure_keeps_memory_state() {
        let (mut store, backing) = store();
        store.merge_directory(&[forum("f1", "general")]).unwrap();
        store.merge_messages("general", &[message("a", "general", 1)]).unwrap();

        backing.set_failing(true);
        assert!(matches!(
            store.persist_directory(),
            Err(GossipError::PersistenceFailure(_))
        ));
        assert!(matches!(
            store.persist_messages("general"),
            Err(GossipError::PersistenceFailure(_))
        ));
        assert_eq!(store.snapshot_directory().len(), 1);
        assert_eq!(store.snapshot_messages("general").len(), 1);

        // The next successful write carries the full state.
        backing.set_failing(false);
        store.persist_messages("general").unwrap();
        assert_eq!(backing.load_messages("general").unwrap().len(), 1);
    }

    #[test]
    fn oversized_remote_fields_reject_the_batch() {
        let mut store = general_store();
        let mut long_body = message("b", "general", 2);
        long_body.body = "x".repeat(MAX_BODY_LENGTH + 1);
        let mut long_author = message("c", "general", 3);
        long_author.author = "a".repeat(MAX_AUTHOR_LENGTH + 1);
        let mut long_token = message("d", "general", 4);
        long_token.token = "t".repeat(MAX_TOKEN_LENGTH + 1);

        for bad in [long_body, long_author, long_token] {
            assert!(matches!(
                store.merge_messages("general", &[message("a", "general", 1), bad]),
                Err(GossipError::MalformedPayload(_))
            ));
        }
        assert!(store.snapshot_messages("general").is_empty());

        let mut long_name = forum("f2", "x");
        long_name.name = "n".repeat(MAX_FORUM_NAME_LENGTH + 1);
        assert!(matches!(
            store.merge_directory(&[long_name]),
            Err(GossipError::MalformedPayload(_))
        ));
    }

    #[test]
    fn messages_for_unknown_forums_are_refused() {
        let (mut store, backing) = store();
        for i in 0..50 {
            let name = format!("ghost-{i}");
            assert_eq!(
                store.merge_messages(&name, &[message(&format!("m{i}"), &name, 1)]),
                Err(GossipError::UnknownForum(name.clone()))
            );
            assert!(store.snapshot_messages(&name).is_empty());
        }
        assert!(store.logs.is_empty());
        assert!(backing.load_messages("ghost-0").unwrap().is_empty());
    }

    #[test]
    fn known_forum_log_is_cached_after_snapshot() {
        let mut store = general_store();
        assert!(store.snapshot_messages("general").is_empty());
        assert!(store.snapshot_messages("elsewhere").is_empty());
        assert_eq!(store.logs.len(), 1);
    }
}
