//! Rule entity: a sum type over five kinds, role derivation, and the
//! idempotent mutators the command service is allowed to use (C2, §3 "Rule",
//! §4.2).

use crate::domain::agent::{IpVersion, Protocol};
use crate::error::{Error, Result};
use crate::ids::short_id::ShortId;

pub const MAX_CHAIN_LENGTH: usize = 10;
pub const MIN_WEIGHT: u32 = 1;
pub const MAX_WEIGHT: u32 = 100;

/// The five rule kinds of §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Direct,
    Entry,
    Chain,
    DirectChain,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Ws,
    Tls,
}

/// Exactly one of a static address/port pair or a node reference (§3
/// "Target").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RuleTarget {
    Static { address: String, port: u16 },
    Node(u64),
}

/// A single weighted exit candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExitWeight {
    pub agent_id: u64,
    pub weight: u32,
}

impl ExitWeight {
    pub fn new(agent_id: u64, weight: u32) -> Result<Self> {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            return Err(Error::validation(format!(
                "load-balance weight must be within {MIN_WEIGHT}..{MAX_WEIGHT}, got {weight}"
            )));
        }
        Ok(Self { agent_id, weight })
    }
}

/// `entry` rules load-balance across one or more exit agents (§3, §4).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitTarget {
    Single(u64),
    Weighted(Vec<ExitWeight>),
}

impl ExitTarget {
    pub fn all_exit_agent_ids(&self) -> Vec<u64> {
        match self {
            ExitTarget::Single(id) => vec![*id],
            ExitTarget::Weighted(weights) => weights.iter().map(|w| w.agent_id).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceStrategy {
    Failover,
    Weighted,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::Failover
    }
}

/// The agent's role within a single rule, as derived by [`Rule::role_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Entry,
    Exit,
    Chain { position: usize, is_last: bool },
    None,
}

/// A single forwarding configuration (§3 "Rule").
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u64,
    pub sid: ShortId,
    pub user_id: Option<u64>,
    pub subscription_id: Option<u64>,
    pub kind: RuleKind,
    pub name: String,
    /// Entry agent for direct/entry/chain/direct_chain; `None` for external.
    pub agent_id: Option<u64>,
    pub listen_port: u16,
    pub target: Option<RuleTarget>,
    pub exit: Option<ExitTarget>,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub chain_agent_ids: Vec<u64>,
    /// `direct_chain` only: agent id -> the static port that agent listens
    /// on for the next hop.
    pub chain_port_config: std::collections::HashMap<u64, u16>,
    pub tunnel_type: Option<TunnelType>,
    pub tunnel_hops: Option<u32>,
    pub status: RuleStatus,
    pub protocol: Protocol,
    pub ip_version: IpVersion,
    pub bind_ip: Option<String>,
    pub traffic_multiplier: Option<u32>,
    pub sort_order: i32,
    pub remark: Option<String>,
    pub group_ids: Vec<u64>,
    /// `external` only.
    pub external_server_address: Option<String>,
}

impl Rule {
    /// Validates the cross-field invariants of §3 that apply regardless of
    /// kind: ownership compatibility, chain length, mutual exclusion.
    pub fn validate_invariants(&self) -> Result<()> {
        match (self.user_id, self.subscription_id) {
            (None, Some(_)) => {
                return Err(Error::validation(
                    "a subscription-bound rule must also carry a user id",
                ))
            }
            _ => {}
        }

        if self.chain_agent_ids.len() > MAX_CHAIN_LENGTH {
            return Err(Error::validation(format!(
                "chain length {} exceeds the maximum of {MAX_CHAIN_LENGTH}",
                self.chain_agent_ids.len()
            )));
        }

        if matches!(self.kind, RuleKind::DirectChain) {
            for agent_id in &self.chain_agent_ids {
                if !self.chain_port_config.contains_key(agent_id) {
                    return Err(Error::validation(format!(
                        "direct_chain rule missing a port entry for chain agent {agent_id}"
                    )));
                }
            }
        }

        match self.kind {
            RuleKind::Entry | RuleKind::DirectChain => {
                if self.target.is_some() && self.target_is_node() && self.target_is_static() {
                    return Err(Error::validation(
                        "target address and target node are mutually exclusive",
                    ));
                }
            }
            _ => {}
        }

        if matches!(self.kind, RuleKind::Entry) {
            if let Some(ExitTarget::Weighted(weights)) = &self.exit {
                for w in weights {
                    if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&w.weight) {
                        return Err(Error::validation(format!(
                            "load-balance weight must be within {MIN_WEIGHT}..{MAX_WEIGHT}"
                        )));
                    }
                }
            }
        }

        if matches!(self.kind, RuleKind::External) && self.agent_id.is_some() {
            return Err(Error::validation("external rules do not have an entry agent"));
        }

        Ok(())
    }

    fn target_is_node(&self) -> bool {
        matches!(self.target, Some(RuleTarget::Node(_)))
    }

    fn target_is_static(&self) -> bool {
        matches!(self.target, Some(RuleTarget::Static { .. }))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.status, RuleStatus::Enabled)
    }

    pub fn has_target_node(&self) -> bool {
        self.target_is_node()
    }

    /// Every exit agent id this rule references (entry kind only; empty
    /// otherwise).
    pub fn get_all_exit_agent_ids(&self) -> Vec<u64> {
        self.exit
            .as_ref()
            .map(|e| e.all_exit_agent_ids())
            .unwrap_or_default()
    }

    pub fn chain_agent_ids(&self) -> &[u64] {
        &self.chain_agent_ids
    }

    /// The full participant set for config-sync fan-out (§4.6).
    pub fn participant_agent_ids(&self) -> Vec<u64> {
        match self.kind {
            RuleKind::Entry => {
                let mut ids = Vec::new();
                if let Some(entry) = self.agent_id {
                    ids.push(entry);
                }
                ids.extend(self.get_all_exit_agent_ids());
                ids
            }
            RuleKind::Chain | RuleKind::DirectChain => {
                let mut ids = Vec::new();
                if let Some(entry) = self.agent_id {
                    ids.push(entry);
                }
                ids.extend(self.chain_agent_ids.iter().copied());
                ids
            }
            RuleKind::Direct => self.agent_id.into_iter().collect(),
            RuleKind::External => Vec::new(),
        }
    }

    /// Derives `agent_id`'s role in this rule (§4.2).
    pub fn role_of(&self, agent_id: u64) -> Role {
        if self.agent_id == Some(agent_id) && matches!(self.kind, RuleKind::Entry | RuleKind::Chain | RuleKind::DirectChain | RuleKind::Direct) {
            return Role::Entry;
        }
        if matches!(self.kind, RuleKind::Entry) && self.get_all_exit_agent_ids().contains(&agent_id) {
            return Role::Exit;
        }
        if matches!(self.kind, RuleKind::Chain | RuleKind::DirectChain) {
            if let Some(position) = self.chain_agent_ids.iter().position(|id| *id == agent_id) {
                return Role::Chain {
                    position,
                    is_last: position + 1 == self.chain_agent_ids.len(),
                };
            }
        }
        Role::None
    }

    // --- idempotent mutators (§4.2) ---

    pub fn enable(&mut self) {
        self.status = RuleStatus::Enabled;
    }

    pub fn disable(&mut self) {
        self.status = RuleStatus::Disabled;
    }

    pub fn update_name(&mut self, name: String) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("rule name must not be empty"));
        }
        self.name = name;
        Ok(())
    }

    pub fn update_listen_port(&mut self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::validation("listen port must be auto-assigned, not set to 0 on update"));
        }
        self.listen_port = port;
        Ok(())
    }

    /// Sets a static target, clearing any node reference (§4.4 "Update").
    pub fn update_target(&mut self, address: String, port: u16) -> Result<()> {
        if address.trim().is_empty() || port == 0 {
            return Err(Error::validation("static target requires a non-empty address and nonzero port"));
        }
        self.target = Some(RuleTarget::Static { address, port });
        Ok(())
    }

    /// Sets a node reference, clearing any static target (§4.4 "Update").
    pub fn update_target_node_id(&mut self, node_id: u64) {
        self.target = Some(RuleTarget::Node(node_id));
    }

    pub fn set_group_ids(&mut self, group_ids: Vec<u64>) {
        self.group_ids = group_ids;
    }

    /// Resets accumulated traffic accounting. The domain itself holds no
    /// traffic counters (those live in the traffic cache, C9) — this mutator
    /// exists as the documented seam the service layer calls into before
    /// issuing the repository-level reset. Clears the multiplier back to its
    /// auto default.
    pub fn reset_traffic(&mut self) {
        self.traffic_multiplier = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::short_id::Prefix;

    fn base_rule(kind: RuleKind) -> Rule {
        Rule {
            id: 1,
            sid: ShortId::generate_with(Prefix::Rule, || 1),
            user_id: None,
            subscription_id: None,
            kind,
            name: "r1".into(),
            agent_id: Some(1),
            listen_port: 8080,
            target: Some(RuleTarget::Static {
                address: "10.0.0.1".into(),
                port: 22,
            }),
            exit: None,
            load_balance_strategy: LoadBalanceStrategy::Failover,
            chain_agent_ids: vec![],
            chain_port_config: Default::default(),
            tunnel_type: None,
            tunnel_hops: None,
            status: RuleStatus::Disabled,
            protocol: Protocol::Tcp,
            ip_version: IpVersion::Auto,
            bind_ip: None,
            traffic_multiplier: None,
            sort_order: 0,
            remark: None,
            group_ids: vec![],
            external_server_address: None,
        }
    }

    #[test]
    fn subscription_rule_requires_user_id() {
        let mut rule = base_rule(RuleKind::Direct);
        rule.subscription_id = Some(5);
        assert!(rule.validate_invariants().is_err());
    }

    #[test]
    fn chain_length_eleven_rejected_ten_accepted() {
        let mut rule = base_rule(RuleKind::Chain);
        rule.chain_agent_ids = (1..=10).collect();
        assert!(rule.validate_invariants().is_ok());
        rule.chain_agent_ids = (1..=11).collect();
        assert!(matches!(rule.validate_invariants(), Err(Error::Validation(_))));
    }

    #[test]
    fn direct_chain_requires_port_for_every_hop() {
        let mut rule = base_rule(RuleKind::DirectChain);
        rule.chain_agent_ids = vec![2, 3];
        rule.chain_port_config.insert(2, 9001);
        assert!(rule.validate_invariants().is_err());
        rule.chain_port_config.insert(3, 9002);
        assert!(rule.validate_invariants().is_ok());
    }

    #[test]
    fn weight_bounds_one_and_hundred_accepted_zero_and_101_rejected() {
        assert!(ExitWeight::new(1, 1).is_ok());
        assert!(ExitWeight::new(1, 100).is_ok());
        assert!(ExitWeight::new(1, 0).is_err());
        assert!(ExitWeight::new(1, 101).is_err());
    }

    #[test]
    fn enable_disable_is_idempotent_and_ends_enabled() {
        let mut rule = base_rule(RuleKind::Direct);
        rule.disable();
        rule.enable();
        assert!(rule.is_enabled());
        rule.enable();
        assert!(rule.is_enabled());
    }

    #[test]
    fn update_target_then_node_clears_static_and_vice_versa() {
        let mut rule = base_rule(RuleKind::Direct);
        rule.update_target_node_id(42);
        assert_eq!(rule.target, Some(RuleTarget::Node(42)));
        rule.update_target("1.2.3.4".into(), 80).unwrap();
        assert_eq!(
            rule.target,
            Some(RuleTarget::Static {
                address: "1.2.3.4".into(),
                port: 80
            })
        );
    }

    #[test]
    fn role_derivation_for_entry_and_exit() {
        let mut rule = base_rule(RuleKind::Entry);
        rule.exit = Some(ExitTarget::Single(9));
        assert_eq!(rule.role_of(1), Role::Entry);
        assert_eq!(rule.role_of(9), Role::Exit);
        assert_eq!(rule.role_of(999), Role::None);
    }

    #[test]
    fn role_derivation_for_chain_positions() {
        let mut rule = base_rule(RuleKind::Chain);
        rule.chain_agent_ids = vec![10, 20, 30];
        assert_eq!(rule.role_of(1), Role::Entry);
        assert_eq!(rule.role_of(10), Role::Chain { position: 0, is_last: false });
        assert_eq!(rule.role_of(30), Role::Chain { position: 2, is_last: true });
    }

    #[test]
    fn reset_traffic_clears_the_multiplier() {
        let mut rule = base_rule(RuleKind::Direct);
        rule.traffic_multiplier = Some(150);
        rule.reset_traffic();
        assert_eq!(rule.traffic_multiplier, None);
    }

    #[test]
    fn external_rule_rejects_entry_agent() {
        let mut rule = base_rule(RuleKind::External);
        rule.agent_id = Some(1);
        assert!(rule.validate_invariants().is_err());
    }

    #[test]
    fn participant_set_matches_kind() {
        let mut rule = base_rule(RuleKind::Entry);
        rule.exit = Some(ExitTarget::Weighted(vec![
            ExitWeight::new(9, 50).unwrap(),
            ExitWeight::new(10, 50).unwrap(),
        ]));
        let participants = rule.participant_agent_ids();
        assert_eq!(participants, vec![1, 9, 10]);

        let mut external = base_rule(RuleKind::External);
        external.agent_id = None;
        assert!(external.participant_agent_ids().is_empty());
    }
}
