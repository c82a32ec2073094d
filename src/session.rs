//! Which forum the local user is looking at.
//!
//! The session decides what reaches the UI. Every forum is merged and
//! relayed regardless; only the active one is surfaced.

use std::sync::Arc;

use crate::crypto::TopicKey;
use crate::messages::Forum;
use crate::protocols::TopicMembership;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active(Forum),
}

pub struct SessionController {
    state: SessionState,
    topics: Arc<dyn TopicMembership>,
}

impl SessionController {
    pub fn new(topics: Arc<dyn TopicMembership>) -> Self {
        Self {
            state: SessionState::Idle,
            topics,
        }
    }

    /// Enter `forum`, leaving the previous forum's topic first.
    pub fn join(&mut self, forum: Forum) {
        if let SessionState::Active(current) = &self.state {
            if current.id == forum.id {
                return;
            }
            self.topics.leave_topic(TopicKey::for_forum(&current.id));
        }
        self.topics.join_topic(TopicKey::for_forum(&forum.id));
        self.state = SessionState::Active(forum);
    }

    /// Return to `Idle`. Returns the forum that was active.
    pub fn leave(&mut self) -> Option<Forum> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Active(forum) => {
                self.topics.leave_topic(TopicKey::for_forum(&forum.id));
                Some(forum)
            }
            SessionState::Idle => None,
        }
    }

    pub fn active(&self) -> Option<&Forum> {
        match &self.state {
            SessionState::Active(forum) => Some(forum),
            SessionState::Idle => None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether events for the forum named `forum` reach the UI.
    pub fn surfaces(&self, forum: &str) -> bool {
        self.active().is_some_and(|f| f.name == forum)
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
