//! Rule command service (C4, §4.4): the shared create/update/delete/batch
//! pipeline behind the admin, user, subscription, and chain-of-rules intake
//! surfaces.

use std::collections::HashMap;

use crate::domain::agent::Agent;
use crate::domain::port_allocator::PortAllocator;
use crate::domain::rule::{ExitTarget, ExitWeight, LoadBalanceStrategy, Rule, RuleKind, RuleStatus, RuleTarget, TunnelType};
use crate::error::{Error, Result};
use crate::ids::short_id::ShortId;
use crate::repository::{AgentRepository, ChainRepository, NodeRepository, PlanRepository, PlanType, ResourceGroupRepository, RuleRepository, TransactionManager};
use crate::services::quota_service::RuleQuotaCheck;
use crate::session::known_ports::KnownWsPorts;
use crate::sync::engine::{ConfigSyncEngine, SyncEvent};
use crate::sync::projection::ProjectionContext;

/// A create request common to all four intake surfaces (§4.4). Ownership
/// fields distinguish admin (both `None`), user (`user_id` set), and
/// subscription (both set) rules; the chain-of-rules surface issues one of
/// these per implied hop.
#[derive(Debug, Clone)]
pub struct CreateRuleRequest {
    pub user_id: Option<u64>,
    pub subscription_id: Option<u64>,
    pub kind: RuleKind,
    pub name: String,
    /// Entry agent; required for every kind but `external`.
    pub agent_sid: Option<ShortId>,
    /// `0` means auto-assign (§4.3).
    pub listen_port: u16,
    pub target_address: Option<String>,
    pub target_port: Option<u16>,
    pub target_node_id: Option<u64>,
    /// Single-exit entry rules.
    pub exit_agent_sid: Option<ShortId>,
    /// Weighted entry rules; mutually exclusive with `exit_agent_sid`.
    pub exit_weights: Vec<(ShortId, u32)>,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub chain_agent_sids: Vec<ShortId>,
    pub chain_port_config: HashMap<ShortId, u16>,
    pub tunnel_type: Option<TunnelType>,
    pub tunnel_hops: Option<u32>,
    pub protocol: crate::domain::agent::Protocol,
    pub ip_version: crate::domain::agent::IpVersion,
    pub bind_ip: Option<String>,
    pub traffic_multiplier: Option<u32>,
    pub remark: Option<String>,
    pub group_ids: Vec<u64>,
    pub external_server_address: Option<String>,
    pub start_enabled: bool,
}

/// A `batch_update` patch (§4.4 "Update"): optional-pointer fields mean "no
/// change".
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub target_address: Option<String>,
    pub target_port: Option<u16>,
    pub listen_port: Option<u16>,
    pub traffic_multiplier: Option<u32>,
}

pub struct RuleCommandService<AG, RU, ND, RG, PL, TX, QA, CH> {
    agents: AG,
    rules: RU,
    nodes: ND,
    groups: RG,
    plans: PL,
    tx: TX,
    quota: QA,
    chains: CH,
    sync: ConfigSyncEngine,
    known_ws_ports: KnownWsPorts,
    allocator: PortAllocator,
    server_secret: Vec<u8>,
    /// Bounded retry loop around persistence for auto-assigned ports in the
    /// subscription path (§4.3). Skipped entirely when the caller supplied
    /// an explicit port.
    create_retry_attempts: u32,
}

/// One item's outcome in a partial-failure batch create (§4.4 "Batch
/// operations").
pub enum BatchCreateOutcome {
    Created(Rule),
    Failed(Error),
}

impl<AG, RU, ND, RG, PL, TX, QA, CH> RuleCommandService<AG, RU, ND, RG, PL, TX, QA, CH>
where
    AG: AgentRepository + Sync,
    RU: RuleRepository + Sync,
    ND: NodeRepository + Sync,
    RG: ResourceGroupRepository + Sync,
    PL: PlanRepository + Sync,
    TX: TransactionManager + Sync,
    QA: RuleQuotaCheck + Sync,
    CH: ChainRepository + Sync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: AG,
        rules: RU,
        nodes: ND,
        groups: RG,
        plans: PL,
        tx: TX,
        quota: QA,
        chains: CH,
        sync: ConfigSyncEngine,
        known_ws_ports: KnownWsPorts,
        allocator: PortAllocator,
        server_secret: Vec<u8>,
        create_retry_attempts: u32,
    ) -> Self {
        Self { agents, rules, nodes, groups, plans, tx, quota, chains, sync, known_ws_ports, allocator, server_secret, create_retry_attempts }
    }

    /// The common create pipeline shared by all four intake surfaces (§4.4
    /// "Create algorithm").
    pub async fn create(&self, req: CreateRuleRequest) -> Result<Rule> {
        if req.name.trim().is_empty() {
            return Err(Error::validation("rule name must not be empty"));
        }
        if req.user_id.is_none() && req.subscription_id.is_some() {
            return Err(Error::validation("a subscription-bound rule must also carry a user id"));
        }

        if let Some(user_id) = req.user_id {
            self.quota.check_rule_quota(user_id, req.kind).await?;
        }

        let entry_agent = self.resolve_entry_agent(&req).await?;
        let exit = self.resolve_exit_target(&req).await?;
        let chain_agents = self.resolve_chain_agents(&req).await?;
        self.validate_target_ownership(&req).await?;
        self.validate_group_bindings(&req.group_ids).await?;

        let chain_agent_ids: Vec<u64> = chain_agents.iter().map(|a| a.id).collect();
        let chain_port_config = self.resolve_chain_port_config(&req, &chain_agents)?;
        let auto_assigned = entry_agent.is_some() && req.listen_port == 0;

        let listen_port = match (&entry_agent, req.listen_port) {
            (Some(agent), 0) => self.allocator.assign_available_port(agent, &self.rules, None).await?,
            (Some(agent), port) => {
                if !agent.is_port_allowed(port) {
                    return Err(Error::validation(format!("port {port} is outside the agent's allowed range")));
                }
                if self.rules.is_port_in_use_by_agent(agent.id, port, None).await? {
                    return Err(Error::conflict(format!("port {port} is already in use on this agent")));
                }
                port
            }
            (None, port) => port,
        };

        if matches!(req.kind, RuleKind::DirectChain) {
            for (&agent_id, &port) in &chain_port_config {
                if self.rules.is_port_in_use_by_agent(agent_id, port, None).await? {
                    return Err(Error::conflict(format!("port {port} is already in use on chain agent {agent_id}")));
                }
            }
        }

        let target = self.build_target(&req)?;

        let rule = Rule {
            id: 0,
            sid: ShortId::generate(crate::ids::short_id::Prefix::Rule),
            user_id: req.user_id,
            subscription_id: req.subscription_id,
            kind: req.kind,
            name: req.name,
            agent_id: entry_agent.as_ref().map(|a| a.id),
            listen_port,
            target,
            exit,
            load_balance_strategy: req.load_balance_strategy,
            chain_agent_ids,
            chain_port_config,
            tunnel_type: req.tunnel_type,
            tunnel_hops: req.tunnel_hops,
            status: if req.start_enabled { RuleStatus::Enabled } else { RuleStatus::Disabled },
            protocol: req.protocol,
            ip_version: req.ip_version,
            bind_ip: req.bind_ip,
            traffic_multiplier: req.traffic_multiplier,
            sort_order: 0,
            remark: req.remark,
            group_ids: req.group_ids,
            external_server_address: req.external_server_address,
        };
        rule.validate_invariants()?;

        let persisted = self.create_with_port_retry(rule, entry_agent.as_ref(), auto_assigned).await?;

        if persisted.is_enabled() {
            self.fan_out(&persisted, SyncEvent::Added).await?;
        }
        Ok(persisted)
    }

    /// Persists inside the transaction boundary, retrying with a freshly
    /// assigned port on conflict when the port was auto-assigned (§4.3
    /// "bounded retry loop"); a caller-supplied port conflict was already
    /// reported verbatim by the uniqueness check above.
    async fn create_with_port_retry(&self, mut rule: Rule, entry_agent: Option<&Agent>, auto_assigned: bool) -> Result<Rule> {
        let mut attempts_left = if auto_assigned { self.create_retry_attempts.max(1) } else { 1 };

        loop {
            let attempt = rule.clone();
            match self.tx.run_in_transaction(|| self.rules.create(attempt)).await {
                Ok(persisted) => return Ok(persisted),
                Err(Error::Conflict(_)) if attempts_left > 1 => {
                    attempts_left -= 1;
                    if let Some(agent) = entry_agent {
                        rule.listen_port = self.allocator.assign_available_port(agent, &self.rules, None).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn update_name(&self, sid: &ShortId, name: String) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        rule.update_name(name)?;
        self.rules.update(rule).await
    }

    pub async fn update_target(&self, sid: &ShortId, address: String, port: u16) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        rule.update_target(address, port)?;
        self.rules.update(rule).await
    }

    /// Listen-port change (§4.4 "Update"): revalidates against the entry
    /// agent's allowed range and uniqueness before persisting, then re-fans
    /// to the unchanged participant set.
    pub async fn update_listen_port(&self, sid: &ShortId, port: u16) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        if let Some(agent_id) = rule.agent_id {
            let agent = self.agents.get_by_id(agent_id).await?.ok_or_else(|| Error::not_found(agent_id.to_string()))?;
            if !agent.is_port_allowed(port) {
                return Err(Error::validation(format!("port {port} is outside the agent's allowed range")));
            }
            if self.rules.is_port_in_use_by_agent(agent_id, port, Some(rule.id)).await? {
                return Err(Error::conflict(format!("port {port} is already in use on this agent")));
            }
        }
        rule.update_listen_port(port)?;
        let persisted = self.rules.update(rule).await?;
        if persisted.is_enabled() {
            self.fan_out(&persisted, SyncEvent::Added).await?;
        }
        Ok(persisted)
    }

    /// Clears an override traffic multiplier back to the plan's default
    /// (§4.2 "reset_traffic"); the wire projection never carries the
    /// multiplier, so no re-fan-out is needed.
    pub async fn reset_traffic(&self, sid: &ShortId) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        rule.reset_traffic();
        self.rules.update(rule).await
    }

    pub async fn enable(&self, sid: &ShortId) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        rule.enable();
        let persisted = self.rules.update(rule).await?;
        self.fan_out(&persisted, SyncEvent::Added).await?;
        Ok(persisted)
    }

    pub async fn disable(&self, sid: &ShortId) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        rule.disable();
        let persisted = self.rules.update(rule).await?;
        self.fan_out(&persisted, SyncEvent::Removed).await?;
        Ok(persisted)
    }

    pub async fn delete(&self, sid: &ShortId) -> Result<()> {
        let rule = self.get_by_sid_or_not_found(sid).await?;
        self.rules.delete(rule.id).await?;
        if rule.is_enabled() {
            self.fan_out(&rule, SyncEvent::Removed).await?;
        }
        Ok(())
    }

    /// Retargets a single-exit entry rule's exit agent (§4.4 "Update": "Agent
    /// or exit-agent changes on an enabled rule re-fan the config sync to
    /// both the old and the new set of participants"). Re-fans a `Removed`
    /// for the old exit (covering any old-only participant) before an
    /// `Added` for the persisted rule (covering the new participant and any
    /// still-shared one).
    pub async fn update_exit_agent(&self, sid: &ShortId, new_exit_agent_sid: &ShortId) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        if !matches!(rule.kind, RuleKind::Entry) {
            return Err(Error::validation("only entry rules carry a single exit agent"));
        }
        let new_exit = self
            .agents
            .get_by_sid(new_exit_agent_sid)
            .await?
            .ok_or_else(|| Error::not_found(new_exit_agent_sid.to_string()))?;

        let old_rule = rule.clone();
        rule.exit = Some(ExitTarget::Single(new_exit.id));
        rule.validate_invariants()?;
        let persisted = self.rules.update(rule).await?;

        if persisted.is_enabled() {
            self.fan_out(&old_rule, SyncEvent::Removed).await?;
            self.fan_out(&persisted, SyncEvent::Added).await?;
        }
        Ok(persisted)
    }

    /// Retargets a chain or direct-chain rule's hop list (§4.4 "Update"),
    /// re-fanning to the union of the old and new participant sets the same
    /// way [`Self::update_exit_agent`] does.
    pub async fn update_chain_agents(
        &self,
        sid: &ShortId,
        new_chain_agent_sids: &[ShortId],
        new_chain_port_config: HashMap<ShortId, u16>,
    ) -> Result<Rule> {
        let mut rule = self.get_by_sid_or_not_found(sid).await?;
        if !matches!(rule.kind, RuleKind::Chain | RuleKind::DirectChain) {
            return Err(Error::validation("only chain rules carry a hop list"));
        }
        if new_chain_agent_sids.len() > crate::domain::rule::MAX_CHAIN_LENGTH {
            return Err(Error::validation(format!("chain length {} exceeds the maximum", new_chain_agent_sids.len())));
        }
        let mut new_agents = Vec::with_capacity(new_chain_agent_sids.len());
        for chain_sid in new_chain_agent_sids {
            let agent = self.agents.get_by_sid(chain_sid).await?.ok_or_else(|| Error::not_found(chain_sid.to_string()))?;
            new_agents.push(agent);
        }

        let old_rule = rule.clone();
        rule.chain_agent_ids = new_agents.iter().map(|a| a.id).collect();
        if matches!(rule.kind, RuleKind::DirectChain) {
            let mut resolved = HashMap::with_capacity(new_agents.len());
            for agent in &new_agents {
                let port = new_chain_port_config.get(&agent.sid).copied().ok_or_else(|| {
                    Error::validation(format!("direct_chain rule missing a port entry for chain agent {}", agent.sid))
                })?;
                resolved.insert(agent.id, port);
            }
            rule.chain_port_config = resolved;
        }
        rule.validate_invariants()?;
        let persisted = self.rules.update(rule).await?;

        if persisted.is_enabled() {
            self.fan_out(&old_rule, SyncEvent::Removed).await?;
            self.fan_out(&persisted, SyncEvent::Added).await?;
        }
        Ok(persisted)
    }

    /// Partial-failure batch create: every item is processed independently
    /// and its outcome reported by original index (§4.4 "Batch operations").
    pub async fn batch_create(&self, requests: Vec<CreateRuleRequest>, batch_limit: usize) -> Result<Vec<BatchCreateOutcome>> {
        if requests.len() > batch_limit {
            return Err(Error::validation(format!("batch of {} exceeds the configured limit of {batch_limit}", requests.len())));
        }
        let mut outcomes = Vec::with_capacity(requests.len());
        for req in requests {
            match self.create(req).await {
                Ok(rule) => outcomes.push(BatchCreateOutcome::Created(rule)),
                Err(e) => outcomes.push(BatchCreateOutcome::Failed(e)),
            }
        }
        Ok(outcomes)
    }

    /// Transactional all-or-nothing delete; every id is validated to exist
    /// before any write happens (§4.4 "Batch operations").
    pub async fn batch_delete(&self, sids: &[ShortId], batch_limit: usize) -> Result<()> {
        let deduped: Vec<&ShortId> = dedup(sids);
        if deduped.len() > batch_limit {
            return Err(Error::validation(format!("batch of {} exceeds the configured limit of {batch_limit}", deduped.len())));
        }
        let mut rules = Vec::with_capacity(deduped.len());
        for sid in &deduped {
            rules.push(self.get_by_sid_or_not_found(sid).await?);
        }
        let ids: Vec<u64> = rules.iter().map(|r| r.id).collect();
        self.tx
            .run_in_transaction(|| async {
                for id in &ids {
                    self.rules.delete(*id).await?;
                }
                Ok(())
            })
            .await?;
        for rule in rules.iter().filter(|r| r.is_enabled()) {
            self.fan_out(rule, SyncEvent::Removed).await?;
        }
        Ok(())
    }

    /// Transactional all-or-nothing enable/disable (§4.4 "Batch
    /// operations"): every id is resolved and, for a user-initiated call,
    /// ownership-checked before any write happens.
    pub async fn batch_toggle_status(&self, sids: &[ShortId], enable: bool, owner_user_id: Option<u64>, batch_limit: usize) -> Result<()> {
        let deduped: Vec<&ShortId> = dedup(sids);
        if deduped.len() > batch_limit {
            return Err(Error::validation(format!("batch of {} exceeds the configured limit of {batch_limit}", deduped.len())));
        }
        let mut rules = Vec::with_capacity(deduped.len());
        for sid in &deduped {
            let rule = self.get_by_sid_or_not_found(sid).await?;
            if let Some(user_id) = owner_user_id {
                if rule.user_id != Some(user_id) {
                    return Err(Error::forbidden("cannot toggle a rule owned by another user"));
                }
            }
            rules.push(rule);
        }
        for rule in &mut rules {
            if enable {
                rule.enable();
            } else {
                rule.disable();
            }
        }
        let updated = rules.clone();
        self.tx
            .run_in_transaction(|| async {
                for rule in &updated {
                    self.rules.update(rule.clone()).await?;
                }
                Ok(())
            })
            .await?;
        let event = if enable { SyncEvent::Added } else { SyncEvent::Removed };
        for rule in &updated {
            self.fan_out(rule, event).await?;
        }
        Ok(())
    }

    /// Transactional all-or-nothing patch (§4.4 "Batch operations"): each
    /// unique id is resolved and revalidated before any write happens;
    /// duplicate ids in `patches` execute once using the last-seen patch.
    pub async fn batch_update(&self, patches: Vec<(ShortId, RuleUpdate)>, owner_user_id: Option<u64>, batch_limit: usize) -> Result<Vec<Rule>> {
        let mut last_by_sid: HashMap<ShortId, RuleUpdate> = HashMap::new();
        let mut order = Vec::new();
        for (sid, patch) in patches {
            if !last_by_sid.contains_key(&sid) {
                order.push(sid.clone());
            }
            last_by_sid.insert(sid, patch);
        }
        if order.len() > batch_limit {
            return Err(Error::validation(format!("batch of {} exceeds the configured limit of {batch_limit}", order.len())));
        }

        let mut updated_rules = Vec::with_capacity(order.len());
        for sid in &order {
            let mut rule = self.get_by_sid_or_not_found(sid).await?;
            if let Some(user_id) = owner_user_id {
                if rule.user_id != Some(user_id) {
                    return Err(Error::forbidden("cannot update a rule owned by another user"));
                }
            }
            let patch = last_by_sid.remove(sid).expect("sid was just pushed into order");
            if let Some(name) = patch.name {
                rule.update_name(name)?;
            }
            if let (Some(address), Some(port)) = (patch.target_address, patch.target_port) {
                rule.update_target(address, port)?;
            }
            if let Some(port) = patch.listen_port {
                rule.update_listen_port(port)?;
            }
            if let Some(multiplier) = patch.traffic_multiplier {
                rule.traffic_multiplier = Some(multiplier);
            }
            rule.validate_invariants()?;
            updated_rules.push(rule);
        }

        let to_persist = updated_rules.clone();
        let persisted = self
            .tx
            .run_in_transaction(|| async {
                let mut out = Vec::with_capacity(to_persist.len());
                for rule in to_persist {
                    out.push(self.rules.update(rule).await?);
                }
                Ok(out)
            })
            .await?;

        for rule in persisted.iter().filter(|r| r.is_enabled()) {
            self.fan_out(rule, SyncEvent::Added).await?;
        }
        Ok(persisted)
    }

    /// Creates a chain descriptor and atomically generates + persists its
    /// implied per-hop rules (§4.4 "Chain-of-rules create"), associating the
    /// resulting rule ids with the chain.
    pub async fn create_chain(&self, owner_user_id: Option<u64>, name: String, hop_requests: Vec<CreateRuleRequest>) -> Result<u64> {
        let chain_id = self.chains.create(owner_user_id, name).await?;
        let mut rule_ids = Vec::with_capacity(hop_requests.len());
        for req in hop_requests {
            let rule = self.create(req).await?;
            rule_ids.push(rule.id);
        }
        self.chains.associate_rules(chain_id, &rule_ids).await?;
        Ok(chain_id)
    }

    /// `ReorderForwardRules` (§4.4 "Reorder"): updates `sort_order` for a
    /// batch in one write. Per-item ownership is validated first when
    /// `owner_user_id` is `Some` (a user-initiated reorder).
    pub async fn reorder(&self, orders: HashMap<u64, i32>, owner_user_id: Option<u64>) -> Result<()> {
        if let Some(user_id) = owner_user_id {
            for &rule_id in orders.keys() {
                let rule = self.rules.get_by_id(rule_id).await?.ok_or_else(|| Error::not_found(rule_id.to_string()))?;
                if rule.user_id != Some(user_id) {
                    return Err(Error::forbidden("cannot reorder a rule owned by another user"));
                }
            }
        }
        self.rules.update_sort_orders(&orders).await
    }

    /// Re-emits every enabled rule where `agent_id` participates as exit or
    /// chain hop, after its address or blocked-protocol set changes (§4.6
    /// "Address/blocked-protocol changes").
    pub async fn propagate_agent_topology_change(&self, agent_id: u64) -> Result<()> {
        let mut affected = self.rules.list_enabled_by_exit_agent_id(agent_id).await?;
        affected.extend(self.rules.list_enabled_by_chain_agent_id(agent_id).await?);
        if affected.is_empty() {
            return Ok(());
        }
        let ctx = self.projection_context(&affected).await?;
        self.sync.propagate_affected_rules(&affected, &ctx.as_ref());
        Ok(())
    }

    async fn fan_out(&self, rule: &Rule, event: SyncEvent) -> Result<()> {
        let ctx = self.projection_context(std::slice::from_ref(rule)).await?;
        self.sync.emit_rule_change(rule, event, &ctx.as_ref());
        Ok(())
    }

    async fn projection_context(&self, rules: &[Rule]) -> Result<OwnedProjectionContext> {
        let mut ids: Vec<u64> = rules.iter().flat_map(|r| r.participant_agent_ids()).collect();
        ids.sort_unstable();
        ids.dedup();
        let agents_by_id = self.agents.get_by_ids(&ids).await?;
        Ok(OwnedProjectionContext { agents_by_id, known_ws_ports: self.known_ws_ports.snapshot(), server_secret: self.server_secret.clone() })
    }

    async fn get_by_sid_or_not_found(&self, sid: &ShortId) -> Result<Rule> {
        self.rules.get_by_sid(sid).await?.ok_or_else(|| Error::not_found(sid.to_string()))
    }

    async fn resolve_entry_agent(&self, req: &CreateRuleRequest) -> Result<Option<Agent>> {
        match (&req.agent_sid, req.kind) {
            (Some(sid), _) => {
                let agent = self.agents.get_by_sid(sid).await?.ok_or_else(|| Error::not_found(sid.to_string()))?;
                Ok(Some(agent))
            }
            (None, RuleKind::External) => Ok(None),
            (None, _) => Err(Error::validation("an entry agent is required for this rule kind")),
        }
    }

    async fn resolve_exit_target(&self, req: &CreateRuleRequest) -> Result<Option<ExitTarget>> {
        if !matches!(req.kind, RuleKind::Entry) {
            return Ok(None);
        }
        match (&req.exit_agent_sid, req.exit_weights.is_empty()) {
            (Some(_), false) => Err(Error::validation("exit_agent and exit_agents are mutually exclusive")),
            (Some(sid), true) => {
                let agent = self.agents.get_by_sid(sid).await?.ok_or_else(|| Error::not_found(sid.to_string()))?;
                Ok(Some(ExitTarget::Single(agent.id)))
            }
            (None, true) => Err(Error::validation("entry rules require an exit agent")),
            (None, false) => {
                let mut weights = Vec::with_capacity(req.exit_weights.len());
                for (sid, weight) in &req.exit_weights {
                    let agent = self.agents.get_by_sid(sid).await?.ok_or_else(|| Error::not_found(sid.to_string()))?;
                    weights.push(ExitWeight::new(agent.id, *weight)?);
                }
                Ok(Some(ExitTarget::Weighted(weights)))
            }
        }
    }

    fn build_target(&self, req: &CreateRuleRequest) -> Result<Option<RuleTarget>> {
        match (&req.target_address, req.target_port, req.target_node_id) {
            (Some(address), Some(port), None) => Ok(Some(RuleTarget::Static { address: address.clone(), port })),
            (None, None, Some(node_id)) => Ok(Some(RuleTarget::Node(node_id))),
            (None, None, None) if matches!(req.kind, RuleKind::External) => Ok(None),
            (None, None, None) => Err(Error::validation("a target address+port or a target node is required")),
            _ => Err(Error::validation("target address and target node are mutually exclusive")),
        }
    }

    async fn resolve_chain_agents(&self, req: &CreateRuleRequest) -> Result<Vec<Agent>> {
        if req.chain_agent_sids.len() > crate::domain::rule::MAX_CHAIN_LENGTH {
            return Err(Error::validation(format!("chain length {} exceeds the maximum", req.chain_agent_sids.len())));
        }
        let mut agents = Vec::with_capacity(req.chain_agent_sids.len());
        for sid in &req.chain_agent_sids {
            let agent = self.agents.get_by_sid(sid).await?.ok_or_else(|| Error::not_found(sid.to_string()))?;
            agents.push(agent);
        }
        Ok(agents)
    }

    fn resolve_chain_port_config(&self, req: &CreateRuleRequest, chain_agents: &[Agent]) -> Result<HashMap<u64, u16>> {
        if !matches!(req.kind, RuleKind::DirectChain) {
            return Ok(HashMap::new());
        }
        let mut resolved = HashMap::with_capacity(chain_agents.len());
        for agent in chain_agents {
            let port = req
                .chain_port_config
                .get(&agent.sid)
                .ok_or_else(|| Error::validation(format!("direct_chain rule missing a port entry for chain agent {}", agent.sid)))?;
            resolved.insert(agent.id, *port);
        }
        Ok(resolved)
    }

    async fn validate_target_ownership(&self, req: &CreateRuleRequest) -> Result<()> {
        let Some(node_id) = req.target_node_id else { return Ok(()) };
        let node = self.nodes.get_by_id(node_id).await?.ok_or_else(|| Error::not_found(node_id.to_string()))?;
        match (req.user_id, node.owner_user_id) {
            (Some(user_id), Some(owner)) if user_id != owner => {
                Err(Error::forbidden("user rules can only target nodes owned by the same user"))
            }
            (Some(_), None) => Err(Error::forbidden("user rules can only target nodes owned by the same user")),
            (None, Some(_)) => Err(Error::forbidden("admin rules may not target a user-owned node")),
            _ => Ok(()),
        }
    }

    async fn validate_group_bindings(&self, group_ids: &[u64]) -> Result<()> {
        for &group_id in group_ids {
            let group = self.groups.get_by_id(group_id).await?.ok_or_else(|| Error::not_found(group_id.to_string()))?;
            let plan = self.plans.get_by_id(group.plan_id).await?.ok_or_else(|| Error::not_found(group.plan_id.to_string()))?;
            if plan.plan_type == PlanType::Forward {
                return Err(Error::validation("resource groups bound to a forward plan cannot own their own rules"));
            }
        }
        Ok(())
    }
}

fn dedup(sids: &[ShortId]) -> Vec<&ShortId> {
    let mut seen = std::collections::HashSet::new();
    sids.iter().filter(|sid| seen.insert(*sid)).collect()
}

struct OwnedProjectionContext {
    agents_by_id: HashMap<u64, Agent>,
    known_ws_ports: HashMap<(u64, TunnelType), u16>,
    server_secret: Vec<u8>,
}

impl OwnedProjectionContext {
    fn as_ref(&self) -> ProjectionContext<'_> {
        ProjectionContext {
            agents_by_id: &self.agents_by_id,
            known_ws_ports: &self.known_ws_ports,
            server_secret: &self.server_secret,
        }
    }
}
