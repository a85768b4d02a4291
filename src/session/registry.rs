//! The live session registry (C5, §5 "Session registry").
//!
//! A concurrent map keyed by internal agent ID, one session per agent. A new
//! authenticated connection displaces the old session, which is closed with
//! a normal-closure frame.

use dashmap::DashMap;
use std::sync::Arc;

use crate::session::connection::AgentSession;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<u64, AgentSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session`, returning the displaced prior session (if any)
    /// so the caller can close it.
    pub fn register(&self, session: AgentSession) -> Option<AgentSession> {
        self.sessions.insert(session.agent_id, session)
    }

    pub fn get(&self, agent_id: u64) -> Option<AgentSession> {
        self.sessions.get(&agent_id).map(|e| e.clone())
    }

    pub fn remove(&self, agent_id: u64) {
        self.sessions.remove(&agent_id);
    }

    /// Removes the session only if it's still the one identified by
    /// `agent_id` — guards against a writer task's cleanup racing a newer
    /// connection's registration for the same agent.
    pub fn remove_if_current(&self, agent_id: u64, is_current: impl Fn(&AgentSession) -> bool) {
        self.sessions.remove_if(&agent_id, |_, session| is_current(session));
    }

    pub fn is_connected(&self, agent_id: u64) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::short_id::{Prefix, ShortId};

    fn session(agent_id: u64, seed: usize) -> (AgentSession, tokio::sync::mpsc::Receiver<crate::session::connection::OutboundMessage>) {
        AgentSession::new(agent_id, ShortId::generate_with(Prefix::Agent, || seed), 4)
    }

    #[test]
    fn registering_a_new_agent_returns_no_displaced_session() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session(1, 1);
        assert!(registry.register(s).is_none());
        assert!(registry.is_connected(1));
    }

    #[test]
    fn reconnecting_displaces_the_prior_session() {
        let registry = SessionRegistry::new();
        let (s1, _rx1) = session(1, 1);
        let (s2, _rx2) = session(1, 2);
        registry.register(s1);
        let displaced = registry.register(s2);
        assert!(displaced.is_some());
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn remove_if_current_only_removes_the_matching_generation() {
        let registry = SessionRegistry::new();
        let (s1, _rx1) = session(1, 1);
        let (s2, _rx2) = session(1, 2);
        registry.register(s1.clone());
        registry.register(s2.clone());
        // s1 is stale now; removal guarded on s1's identity must be a no-op.
        registry.remove_if_current(1, |current| current.agent_sid == s1.agent_sid);
        assert!(registry.is_connected(1));
    }
}
