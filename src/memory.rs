//! In-memory implementations of the §6.1 repository contracts (C9).
//!
//! None of this exists in the teacher's split: its persistence and cache
//! layers are real collaborators wired in from outside `acton-service`.
//! This crate's core is deliberately repository-agnostic, so the runnable
//! binary needs *something* concrete to hand it; these `DashMap`-backed
//! stores are that something — a reference backing good enough to run the
//! server end to end, not a production datastore.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::agent::Agent;
use crate::domain::port_allocator::PortAvailability;
use crate::domain::rule::Rule;
use crate::error::Result;
use crate::ids::short_id::ShortId;
use crate::repository::{
    AgentRepository, AgentStatusCache, ChainRepository, ForwardTrafficCache, HourlyTrafficCache, Node,
    NodeRepository, Plan, PlanRepository, ResourceGroup, ResourceGroupRepository, ResourceType,
    RuleRepository, RuleStatusCache, Subscription, SubscriptionRepository, SubscriptionUsageStatsRepository,
    TransactionManager,
};
use crate::session::envelope::{RuleStatusReport, StatusReport};

#[derive(Clone, Default)]
pub struct InMemoryAgents {
    by_id: Arc<DashMap<u64, Agent>>,
}

impl AgentRepository for InMemoryAgents {
    async fn create(&self, agent: Agent) -> Result<Agent> {
        self.by_id.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn update(&self, agent: Agent) -> Result<Agent> {
        self.by_id.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.by_id.remove(&id);
        Ok(())
    }

    async fn get_by_id(&self, id: u64) -> Result<Option<Agent>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }

    async fn get_by_sid(&self, sid: &ShortId) -> Result<Option<Agent>> {
        Ok(self.by_id.iter().find(|e| &e.sid == sid).map(|e| e.clone()))
    }

    async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<Agent>> {
        Ok(self.by_id.iter().find(|e| e.token_hash == token_hash).map(|e| e.clone()))
    }

    async fn get_by_ids(&self, ids: &[u64]) -> Result<HashMap<u64, Agent>> {
        Ok(ids.iter().filter_map(|id| self.by_id.get(id).map(|e| (*id, e.clone()))).collect())
    }

    async fn get_sids_by_ids(&self, ids: &[u64]) -> Result<HashMap<u64, ShortId>> {
        Ok(ids.iter().filter_map(|id| self.by_id.get(id).map(|e| (*id, e.sid.clone()))).collect())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.by_id.iter().map(|e| e.clone()).collect())
    }

    async fn exists_by_name(&self, name: &str) -> Result<bool> {
        Ok(self.by_id.iter().any(|e| e.name == name))
    }

    async fn touch_last_seen(&self, _agent_id: u64, _at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRules {
    by_id: Arc<DashMap<u64, Rule>>,
}

impl PortAvailability for InMemoryRules {
    async fn is_port_in_use_by_agent(&self, agent_id: u64, port: u16, exclude_rule_id: Option<u64>) -> Result<bool> {
        Ok(self.by_id.iter().any(|e| {
            let rule = e.value();
            if Some(rule.id) == exclude_rule_id {
                return false;
            }
            (rule.agent_id == Some(agent_id) && rule.listen_port == port)
                || rule.chain_port_config.get(&agent_id) == Some(&port)
        }))
    }
}

impl RuleRepository for InMemoryRules {
    async fn create(&self, rule: Rule) -> Result<Rule> {
        self.by_id.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update(&self, rule: Rule) -> Result<Rule> {
        self.by_id.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.by_id.remove(&id);
        Ok(())
    }

    async fn get_by_id(&self, id: u64) -> Result<Option<Rule>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }

    async fn get_by_sid(&self, sid: &ShortId) -> Result<Option<Rule>> {
        Ok(self.by_id.iter().find(|e| &e.sid == sid).map(|e| e.clone()))
    }

    async fn get_by_sids(&self, sids: &[ShortId]) -> Result<Vec<Rule>> {
        Ok(self.by_id.iter().filter(|e| sids.contains(&e.sid)).map(|e| e.clone()).collect())
    }

    async fn list(&self) -> Result<Vec<Rule>> {
        Ok(self.by_id.iter().map(|e| e.clone()).collect())
    }

    async fn list_by_user_id(&self, user_id: u64) -> Result<Vec<Rule>> {
        Ok(self.by_id.iter().filter(|e| e.user_id == Some(user_id)).map(|e| e.clone()).collect())
    }

    async fn list_by_subscription_id(&self, subscription_id: u64) -> Result<Vec<Rule>> {
        Ok(self
            .by_id
            .iter()
            .filter(|e| e.subscription_id == Some(subscription_id))
            .map(|e| e.clone())
            .collect())
    }

    async fn list_by_group_id(&self, group_id: u64) -> Result<Vec<Rule>> {
        Ok(self.by_id.iter().filter(|e| e.group_ids.contains(&group_id)).map(|e| e.clone()).collect())
    }

    async fn list_enabled_by_agent_id(&self, agent_id: u64) -> Result<Vec<Rule>> {
        Ok(self
            .by_id
            .iter()
            .filter(|e| e.is_enabled() && e.agent_id == Some(agent_id))
            .map(|e| e.clone())
            .collect())
    }

    async fn list_enabled_by_exit_agent_id(&self, agent_id: u64) -> Result<Vec<Rule>> {
        Ok(self
            .by_id
            .iter()
            .filter(|e| e.is_enabled() && e.get_all_exit_agent_ids().contains(&agent_id))
            .map(|e| e.clone())
            .collect())
    }

    async fn list_enabled_by_chain_agent_id(&self, agent_id: u64) -> Result<Vec<Rule>> {
        Ok(self
            .by_id
            .iter()
            .filter(|e| e.is_enabled() && e.chain_agent_ids().contains(&agent_id))
            .map(|e| e.clone())
            .collect())
    }

    async fn get_exit_rule_by_agent_id(&self, agent_id: u64) -> Result<Option<Rule>> {
        Ok(self.by_id.iter().find(|e| e.get_all_exit_agent_ids().contains(&agent_id)).map(|e| e.clone()))
    }

    async fn count_by_user_id(&self, user_id: u64) -> Result<u64> {
        Ok(self.by_id.iter().filter(|e| e.user_id == Some(user_id)).count() as u64)
    }

    async fn count_by_subscription_id(&self, subscription_id: u64) -> Result<u64> {
        Ok(self.by_id.iter().filter(|e| e.subscription_id == Some(subscription_id)).count() as u64)
    }

    async fn get_total_traffic_by_user_id(&self, _user_id: u64) -> Result<u64> {
        Ok(0)
    }

    async fn update_sort_orders(&self, orders: &HashMap<u64, i32>) -> Result<()> {
        for (id, order) in orders {
            if let Some(mut rule) = self.by_id.get_mut(id) {
                rule.sort_order = *order;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryChains {
    next_id: Arc<std::sync::atomic::AtomicU64>,
    owners: Arc<DashMap<u64, Option<u64>>>,
    rules_by_chain: Arc<DashMap<u64, Vec<u64>>>,
}

impl ChainRepository for InMemoryChains {
    async fn create(&self, owner_user_id: Option<u64>, _name: String) -> Result<u64> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        self.owners.insert(id, owner_user_id);
        Ok(id)
    }

    async fn update(&self, _chain_id: u64, _name: String) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, chain_id: u64) -> Result<()> {
        self.owners.remove(&chain_id);
        self.rules_by_chain.remove(&chain_id);
        Ok(())
    }

    async fn get_by_id(&self, chain_id: u64) -> Result<Option<u64>> {
        Ok(self.owners.get(&chain_id).map(|_| chain_id))
    }

    async fn associate_rules(&self, chain_id: u64, rule_ids: &[u64]) -> Result<()> {
        self.rules_by_chain.insert(chain_id, rule_ids.to_vec());
        Ok(())
    }

    async fn get_rule_ids_by_chain_id(&self, chain_id: u64) -> Result<Vec<u64>> {
        Ok(self.rules_by_chain.get(&chain_id).map(|e| e.clone()).unwrap_or_default())
    }

    async fn list(&self, owner_user_id: Option<u64>) -> Result<Vec<u64>> {
        Ok(self
            .owners
            .iter()
            .filter(|e| owner_user_id.is_none() || *e.value() == owner_user_id)
            .map(|e| *e.key())
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNodes {
    by_id: Arc<DashMap<u64, Node>>,
}

impl NodeRepository for InMemoryNodes {
    async fn get_by_id(&self, id: u64) -> Result<Option<Node>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryGroups {
    by_id: Arc<DashMap<u64, ResourceGroup>>,
}

impl ResourceGroupRepository for InMemoryGroups {
    async fn get_by_id(&self, id: u64) -> Result<Option<ResourceGroup>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPlans {
    by_id: Arc<DashMap<u64, Plan>>,
}

impl PlanRepository for InMemoryPlans {
    async fn get_by_id(&self, id: u64) -> Result<Option<Plan>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }
}

#[derive(Clone, Default)]
pub struct InMemorySubscriptions {
    by_id: Arc<DashMap<u64, Subscription>>,
}

impl SubscriptionRepository for InMemorySubscriptions {
    async fn get_by_id(&self, id: u64) -> Result<Option<Subscription>> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }

    async fn list_active_by_user_id(&self, user_id: u64) -> Result<Vec<Subscription>> {
        Ok(self.by_id.iter().filter(|e| e.user_id == user_id && e.active).map(|e| e.clone()).collect())
    }
}

/// Backs both the hot (24h) hourly cache and the cold daily-stats
/// repository with the same zeroed reading — traffic accounting has its own
/// real store elsewhere; this one just needs to answer without panicking so
/// the quota path has something to compose against.
#[derive(Clone, Copy, Default)]
pub struct InMemoryUsage;

impl HourlyTrafficCache for InMemoryUsage {
    async fn get_total_traffic_by_subscription_ids(
        &self,
        _subscription_ids: &[u64],
        _resource_type: ResourceType,
        _from: chrono::DateTime<chrono::Utc>,
        _to: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        Ok(0)
    }
}

impl SubscriptionUsageStatsRepository for InMemoryUsage {
    async fn get_daily_traffic(
        &self,
        _subscription_ids: &[u64],
        _resource_type: ResourceType,
        _from: chrono::DateTime<chrono::Utc>,
        _to: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        Ok(0)
    }
}

/// No real database behind this binary, so a transaction is just a call —
/// correct because every write here already lands in its own `DashMap`
/// atomically; there's no multi-statement rollback to coordinate.
#[derive(Clone, Copy, Default)]
pub struct InMemoryTx;

impl TransactionManager for InMemoryTx {
    async fn run_in_transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        f().await
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTrafficCache {
    totals: Arc<DashMap<u64, (u64, u64)>>,
}

impl ForwardTrafficCache for InMemoryTrafficCache {
    async fn cleanup_rule_cache(&self, rule_id: u64) -> Result<()> {
        self.totals.remove(&rule_id);
        Ok(())
    }

    async fn record_rule_traffic(&self, rule_id: u64, upload_bytes: u64, download_bytes: u64) -> Result<()> {
        let mut entry = self.totals.entry(rule_id).or_insert((0, 0));
        entry.0 += upload_bytes;
        entry.1 += download_bytes;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStatusCache {
    agent_status: Arc<DashMap<u64, StatusReport>>,
    rule_status: Arc<DashMap<(u64, u64), RuleStatusReport>>,
}

impl AgentStatusCache for InMemoryStatusCache {
    async fn put_status(&self, agent_id: u64, status: StatusReport) -> Result<()> {
        self.agent_status.insert(agent_id, status);
        Ok(())
    }

    async fn get_status(&self, agent_id: u64) -> Result<Option<StatusReport>> {
        Ok(self.agent_status.get(&agent_id).map(|e| e.clone()))
    }
}

impl RuleStatusCache for InMemoryStatusCache {
    async fn put_rule_statuses(&self, agent_id: u64, statuses: Vec<RuleStatusReport>) -> Result<()> {
        self.rule_status.retain(|(aid, _), _| *aid != agent_id);
        for status in statuses {
            self.rule_status.insert((agent_id, status.rule_id), status);
        }
        Ok(())
    }

    async fn get_rule_status(&self, agent_id: u64, rule_id: u64) -> Result<Option<RuleStatusReport>> {
        Ok(self.rule_status.get(&(agent_id, rule_id)).map(|e| e.clone()))
    }
}
