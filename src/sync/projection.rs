//! Per-agent role-specialized projection of a rule (§4.6 "Per-agent
//! projection").

use std::collections::HashMap;

use crate::domain::agent::Agent;
use crate::domain::rule::{Role, Rule, RuleKind, TunnelType};
use crate::ids::short_id::ShortId;
use crate::ids::token::AgentToken;
use crate::session::envelope::{RuleRole, RuleSyncData};

/// Read-only context the projector needs: the agent directory (for
/// addresses and short IDs) and the last known tunnel listen port per
/// `(agent_id, tunnel_type)`, as reported through `status` (§4.6
/// "Port-change propagation"). Ws and tls listeners are independent ports on
/// the same agent, so the tunnel type is part of the key.
pub struct ProjectionContext<'a> {
    pub agents_by_id: &'a HashMap<u64, Agent>,
    pub known_ws_ports: &'a HashMap<(u64, TunnelType), u16>,
    pub server_secret: &'a [u8],
}

/// Projects `rule` into the view `agent_id` needs, or `None` if `agent_id`
/// does not participate in this rule.
pub fn project(rule: &Rule, agent_id: u64, ctx: &ProjectionContext) -> Option<RuleSyncData> {
    let role = rule.role_of(agent_id);
    if matches!(role, Role::None) {
        return None;
    }

    let mut data = RuleSyncData {
        rule_id: rule.id,
        role: RuleRole::from(role),
        chain_position: None,
        is_last_in_chain: None,
        next_hop_agent_id: None,
        next_hop_address: None,
        next_hop_ws_port: None,
        next_hop_port: None,
        next_hop_connection_token: None,
        agent_id: None,
    };

    match role {
        Role::Entry => project_entry(rule, &mut data, ctx),
        Role::Exit => project_exit(rule, &mut data, ctx),
        Role::Chain { position, is_last } => {
            data.chain_position = Some(position);
            data.is_last_in_chain = Some(is_last);
            project_chain_hop(rule, position, &mut data, ctx);
        }
        Role::None => unreachable!("checked above"),
    }

    Some(data)
}

fn project_entry(rule: &Rule, data: &mut RuleSyncData, ctx: &ProjectionContext) {
    let next_hop = match rule.kind {
        RuleKind::Entry => rule.get_all_exit_agent_ids().first().copied(),
        RuleKind::Chain | RuleKind::DirectChain => rule.chain_agent_ids().first().copied(),
        RuleKind::Direct | RuleKind::External => None,
    };

    let Some(next_hop_id) = next_hop else { return };
    let Some(next_hop_agent) = ctx.agents_by_id.get(&next_hop_id) else { return };

    data.next_hop_agent_id = Some(next_hop_agent.sid.to_string());
    data.next_hop_address = Some(next_hop_agent.tunnel_address.clone());

    if matches!(rule.kind, RuleKind::DirectChain) {
        data.next_hop_port = rule.chain_port_config.get(&next_hop_id).copied();
    } else {
        if let Some(tunnel_type) = rule.tunnel_type {
            data.next_hop_ws_port = ctx.known_ws_ports.get(&(next_hop_id, tunnel_type)).copied();
        }
        data.next_hop_connection_token = Some(mint_connection_token(&next_hop_agent.sid, ctx.server_secret));
    }
}

fn project_exit(rule: &Rule, data: &mut RuleSyncData, ctx: &ProjectionContext) {
    if let Some(entry_id) = rule.agent_id {
        if let Some(entry_agent) = ctx.agents_by_id.get(&entry_id) {
            data.agent_id = Some(entry_agent.sid.to_string());
        }
    }
}

fn project_chain_hop(rule: &Rule, position: usize, data: &mut RuleSyncData, ctx: &ProjectionContext) {
    let origin_id = if position == 0 {
        rule.agent_id
    } else {
        rule.chain_agent_ids().get(position - 1).copied()
    };
    if let Some(origin_id) = origin_id {
        if let Some(origin_agent) = ctx.agents_by_id.get(&origin_id) {
            data.agent_id = Some(origin_agent.sid.to_string());
        }
    }

    if let Some(&next_hop_id) = rule.chain_agent_ids().get(position + 1) {
        if let Some(next_hop_agent) = ctx.agents_by_id.get(&next_hop_id) {
            data.next_hop_agent_id = Some(next_hop_agent.sid.to_string());
            data.next_hop_address = Some(next_hop_agent.tunnel_address.clone());
            if matches!(rule.kind, RuleKind::DirectChain) {
                data.next_hop_port = rule.chain_port_config.get(&next_hop_id).copied();
            } else {
                if let Some(tunnel_type) = rule.tunnel_type {
                    data.next_hop_ws_port = ctx.known_ws_ports.get(&(next_hop_id, tunnel_type)).copied();
                }
                data.next_hop_connection_token =
                    Some(mint_connection_token(&next_hop_agent.sid, ctx.server_secret));
            }
        }
    }
}

/// A connection token is just an agent token minted for the next hop,
/// rotated on every emission (§6.2).
fn mint_connection_token(next_hop_sid: &ShortId, server_secret: &[u8]) -> String {
    AgentToken::generate(next_hop_sid, server_secret).token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{ExitTarget, RuleStatus, RuleTarget};
    use crate::ids::short_id::Prefix;
    use std::collections::HashSet;

    fn agent(id: u64, seed: usize) -> Agent {
        let mut a = Agent::new(
            id,
            ShortId::generate_with(Prefix::Agent, || seed),
            format!("agent-{id}"),
            "1.2.3.4".into(),
            "10.0.0.1".into(),
            vec![],
            HashSet::new(),
            "hash".into(),
        )
        .unwrap();
        a.enabled = true;
        a
    }

    fn entry_rule(entry: u64, exit: u64) -> Rule {
        Rule {
            id: 1,
            sid: ShortId::generate_with(Prefix::Rule, || 1),
            user_id: None,
            subscription_id: None,
            kind: RuleKind::Entry,
            name: "r1".into(),
            agent_id: Some(entry),
            listen_port: 8081,
            target: Some(RuleTarget::Static { address: "10.0.0.10".into(), port: 3306 }),
            exit: Some(ExitTarget::Single(exit)),
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

    #[test]
    fn entry_projection_carries_next_hop_fields() {
        let e = agent(1, 1);
        let x = agent(2, 2);
        let mut rule = entry_rule(1, 2);
        rule.tunnel_type = Some(TunnelType::Ws);
        let mut agents = HashMap::new();
        agents.insert(1, e);
        agents.insert(2, x.clone());
        let mut ports = HashMap::new();
        ports.insert((2, TunnelType::Ws), 9000);
        let ctx = ProjectionContext {
            agents_by_id: &agents,
            known_ws_ports: &ports,
            server_secret: b"secret",
        };

        let projected = project(&rule, 1, &ctx).unwrap();
        assert_eq!(projected.role, RuleRole::Entry);
        assert_eq!(projected.next_hop_agent_id, Some(x.sid.to_string()));
        assert_eq!(projected.next_hop_ws_port, Some(9000));
        assert!(projected.next_hop_connection_token.is_some());
    }

    #[test]
    fn exit_projection_carries_the_entry_agents_short_id() {
        let e = agent(1, 1);
        let x = agent(2, 2);
        let rule = entry_rule(1, 2);
        let mut agents = HashMap::new();
        agents.insert(1, e.clone());
        agents.insert(2, x);
        let ports = HashMap::new();
        let ctx = ProjectionContext {
            agents_by_id: &agents,
            known_ws_ports: &ports,
            server_secret: b"secret",
        };

        let projected = project(&rule, 2, &ctx).unwrap();
        assert_eq!(projected.role, RuleRole::Exit);
        assert_eq!(projected.agent_id, Some(e.sid.to_string()));
    }

    #[test]
    fn non_participant_agent_projects_to_none() {
        let rule = entry_rule(1, 2);
        let agents = HashMap::new();
        let ports = HashMap::new();
        let ctx = ProjectionContext {
            agents_by_id: &agents,
            known_ws_ports: &ports,
            server_secret: b"secret",
        };
        assert!(project(&rule, 999, &ctx).is_none());
    }
}
