//! The config sync fan-out engine (C6).
//!
//! Purely a fan-out: it does not commit state. The rule command service
//! calls it after a transaction commits; it never participates in the
//! transaction itself (§4.6).

use dashmap::{DashMap, DashSet};
use std::sync::Arc;

use crate::domain::rule::Rule;
use crate::session::connection::SendError;
use crate::session::envelope::{ConfigAck, ConfigSync, Envelope, MessageType};
use crate::session::registry::SessionRegistry;
use crate::sync::projection::{project, ProjectionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Added,
    Updated,
    Removed,
}

#[derive(Clone)]
pub struct ConfigSyncEngine {
    registry: SessionRegistry,
    versions: Arc<DashMap<u64, u64>>,
    last_emission_was_full: Arc<DashMap<u64, bool>>,
    pending_resync: Arc<DashSet<u64>>,
}

impl ConfigSyncEngine {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            versions: Arc::new(DashMap::new()),
            last_emission_was_full: Arc::new(DashMap::new()),
            pending_resync: Arc::new(DashSet::new()),
        }
    }

    fn next_version(&self, agent_id: u64) -> u64 {
        let mut entry = self.versions.entry(agent_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Emits the full rule set for `agent_id` on session establishment
    /// (§4.6 "Full sync vs incremental").
    pub fn full_sync(
        &self,
        agent_id: u64,
        rules: &[Rule],
        ctx: &ProjectionContext,
        client_token: String,
        token_signing_secret: String,
    ) {
        let added = rules
            .iter()
            .filter_map(|rule| project(rule, agent_id, ctx))
            .collect::<Vec<_>>();

        let sync = ConfigSync {
            version: self.next_version(agent_id),
            full_sync: true,
            added,
            updated: Vec::new(),
            removed: Vec::new(),
            client_token: Some(client_token),
            token_signing_secret: Some(token_signing_secret),
        };

        self.last_emission_was_full.insert(agent_id, true);
        self.deliver(agent_id, sync);
    }

    /// Fans `rule` out to every current participant as an incremental
    /// `added`/`updated`/`removed` event (§4.6 "Participant set per rule").
    pub fn emit_rule_change(&self, rule: &Rule, event: SyncEvent, ctx: &ProjectionContext) {
        for agent_id in rule.participant_agent_ids() {
            let version = self.next_version(agent_id);
            let sync = match event {
                SyncEvent::Added => ConfigSync {
                    version,
                    full_sync: false,
                    added: project(rule, agent_id, ctx).into_iter().collect(),
                    updated: Vec::new(),
                    removed: Vec::new(),
                    client_token: None,
                    token_signing_secret: None,
                },
                SyncEvent::Updated => ConfigSync {
                    version,
                    full_sync: false,
                    added: Vec::new(),
                    updated: project(rule, agent_id, ctx).into_iter().collect(),
                    removed: Vec::new(),
                    client_token: None,
                    token_signing_secret: None,
                },
                SyncEvent::Removed => ConfigSync {
                    version,
                    full_sync: false,
                    added: Vec::new(),
                    updated: Vec::new(),
                    removed: vec![rule.id],
                    client_token: None,
                    token_signing_secret: None,
                },
            };
            self.last_emission_was_full.insert(agent_id, false);
            self.deliver(agent_id, sync);
        }
    }

    /// Re-emits a batch of already-resolved rules as `updated` events — used
    /// for address-change, blocked-protocol-change, and port-change
    /// propagation (§4.6), where the caller has already queried which rules
    /// are affected.
    pub fn propagate_affected_rules(&self, rules: &[Rule], ctx: &ProjectionContext) {
        for rule in rules {
            self.emit_rule_change(rule, SyncEvent::Updated, ctx);
        }
    }

    /// Applies an agent's `config_ack`. A failed ack on a non-full sync
    /// marks the agent for a compensating full resync on its next connect
    /// (§4.6 "Acknowledged").
    pub fn handle_ack(&self, agent_id: u64, ack: &ConfigAck) {
        if ack.success {
            return;
        }
        let was_full = self.last_emission_was_full.get(&agent_id).map(|v| *v).unwrap_or(false);
        if !was_full {
            self.pending_resync.insert(agent_id);
        }
    }

    pub fn needs_full_resync(&self, agent_id: u64) -> bool {
        self.pending_resync.contains(&agent_id)
    }

    pub fn clear_resync_flag(&self, agent_id: u64) {
        self.pending_resync.remove(&agent_id);
    }

    /// At-least-once, fire-and-forget delivery (§4.6 "Delivery semantics").
    /// Failures never propagate to the caller; they're an observability
    /// concern, not an API failure (§7 "Propagation policy").
    fn deliver(&self, agent_id: u64, sync: ConfigSync) {
        let Some(session) = self.registry.get(agent_id) else {
            tracing::debug!(agent_id, "config_sync skipped: agent has no live session");
            return;
        };

        let envelope = Envelope::new(
            MessageType::ConfigSync,
            chrono::Utc::now(),
            serde_json::to_value(&sync).expect("ConfigSync always serializes"),
        );
        let Ok(payload) = serde_json::to_string(&envelope) else {
            tracing::warn!(agent_id, "config_sync envelope failed to serialize");
            return;
        };

        match session.try_send_text(payload) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                tracing::warn!(agent_id, "config_sync dropped: send queue full");
            }
            Err(SendError::Closed) => {
                tracing::debug!(agent_id, "config_sync dropped: session already closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::Agent;
    use crate::domain::rule::{ExitTarget, RuleKind, RuleStatus, RuleTarget};
    use crate::ids::short_id::{Prefix, ShortId};
    use crate::session::connection::AgentSession;
    use std::collections::{HashMap, HashSet};

    fn agent(id: u64, seed: usize) -> Agent {
        Agent::new(
            id,
            ShortId::generate_with(Prefix::Agent, || seed),
            format!("a{id}"),
            String::new(),
            "tunnel".into(),
            vec![],
            HashSet::new(),
            "hash".into(),
        )
        .unwrap()
    }

    fn entry_rule() -> Rule {
        Rule {
            id: 1,
            sid: ShortId::generate_with(Prefix::Rule, || 1),
            user_id: None,
            subscription_id: None,
            kind: RuleKind::Entry,
            name: "r".into(),
            agent_id: Some(1),
            listen_port: 8080,
            target: Some(RuleTarget::Static { address: "1.1.1.1".into(), port: 80 }),
            exit: Some(ExitTarget::Single(2)),
            load_balance_strategy: Default::default(),
            chain_agent_ids: vec![],
            chain_port_config: Default::default(),
            tunnel_type: None,
            tunnel_hops: None,
            status: RuleStatus::Enabled,
            protocol: crate::domain::agent::Protocol::Tcp,
            ip_version: crate::domain::agent::IpVersion::Auto,
            bind_ip: None,
            traffic_multiplier: None,
            sort_order: 0,
            remark: None,
            group_ids: vec![],
            external_server_address: None,
        }
    }

    #[tokio::test]
    async fn emitting_a_rule_change_reaches_every_participant_session() {
        let registry = SessionRegistry::new();
        let (entry_session, mut entry_rx) = AgentSession::new(1, ShortId::generate_with(Prefix::Agent, || 1), 8);
        let (exit_session, mut exit_rx) = AgentSession::new(2, ShortId::generate_with(Prefix::Agent, || 2), 8);
        registry.register(entry_session);
        registry.register(exit_session);

        let engine = ConfigSyncEngine::new(registry);
        let rule = entry_rule();
        let mut agents = HashMap::new();
        agents.insert(1, agent(1, 1));
        agents.insert(2, agent(2, 2));
        let ports = HashMap::new();
        let ctx = ProjectionContext {
            agents_by_id: &agents,
            known_ws_ports: &ports,
            server_secret: b"secret",
        };

        engine.emit_rule_change(&rule, SyncEvent::Added, &ctx);

        assert!(entry_rx.try_recv().is_ok());
        assert!(exit_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn missing_session_does_not_panic_or_error() {
        let engine = ConfigSyncEngine::new(SessionRegistry::new());
        let rule = entry_rule();
        let agents = HashMap::new();
        let ports = HashMap::new();
        let ctx = ProjectionContext {
            agents_by_id: &agents,
            known_ws_ports: &ports,
            server_secret: b"secret",
        };
        engine.emit_rule_change(&rule, SyncEvent::Removed, &ctx);
    }

    #[test]
    fn failed_ack_on_incremental_sync_marks_agent_for_resync() {
        let engine = ConfigSyncEngine::new(SessionRegistry::new());
        engine.last_emission_was_full.insert(1, false);
        engine.handle_ack(1, &ConfigAck { version: 1, success: false, error: None });
        assert!(engine.needs_full_resync(1));
        engine.clear_resync_flag(1);
        assert!(!engine.needs_full_resync(1));
    }

    #[test]
    fn failed_ack_on_full_sync_does_not_mark_for_resync() {
        let engine = ConfigSyncEngine::new(SessionRegistry::new());
        engine.last_emission_was_full.insert(1, true);
        engine.handle_ack(1, &ConfigAck { version: 1, success: false, error: None });
        assert!(!engine.needs_full_resync(1));
    }

    #[test]
    fn successful_ack_never_marks_for_resync() {
        let engine = ConfigSyncEngine::new(SessionRegistry::new());
        engine.last_emission_was_full.insert(1, false);
        engine.handle_ack(1, &ConfigAck { version: 1, success: true, error: None });
        assert!(!engine.needs_full_resync(1));
    }

    #[test]
    fn version_is_monotonic_per_agent() {
        let engine = ConfigSyncEngine::new(SessionRegistry::new());
        assert_eq!(engine.next_version(1), 1);
        assert_eq!(engine.next_version(1), 2);
        assert_eq!(engine.next_version(2), 1);
    }
}
