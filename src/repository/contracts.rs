//! Narrow read/write contracts the core depends on (§6.1).
//!
//! None of these traits are implemented in this crate — a transactional
//! relational store and a Redis-style cache satisfy them elsewhere. Domain
//! entities ([`crate::domain::agent::Agent`], [`crate::domain::rule::Rule`])
//! are the values these contracts move across the boundary; the handful of
//! narrow read-only shapes below (`Node`, `Plan`, `Subscription`, …) exist
//! only because the core needs to reason about them, not because this crate
//! owns their lifecycle.

use std::collections::HashMap;
use std::future::Future;

use crate::domain::agent::Agent;
use crate::domain::port_allocator::PortAvailability;
use crate::domain::rule::{Rule, RuleKind};
use crate::error::Result;
use crate::ids::short_id::ShortId;

/// `AgentRepository` (§6.1).
pub trait AgentRepository {
    fn create(&self, agent: Agent) -> impl Future<Output = Result<Agent>> + Send;
    fn update(&self, agent: Agent) -> impl Future<Output = Result<Agent>> + Send;
    fn delete(&self, id: u64) -> impl Future<Output = Result<()>> + Send;
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<Agent>>> + Send;
    fn get_by_sid(&self, sid: &ShortId) -> impl Future<Output = Result<Option<Agent>>> + Send;
    fn get_by_token_hash(&self, token_hash: &str) -> impl Future<Output = Result<Option<Agent>>> + Send;
    fn get_by_ids(&self, ids: &[u64]) -> impl Future<Output = Result<HashMap<u64, Agent>>> + Send;
    fn get_sids_by_ids(&self, ids: &[u64]) -> impl Future<Output = Result<HashMap<u64, ShortId>>> + Send;
    fn list(&self) -> impl Future<Output = Result<Vec<Agent>>> + Send;
    fn exists_by_name(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;
    /// Rate-limited by the caller (§4.7 "last-seen DB writes"); not part of
    /// §6.1's enumerated method list, but the aggregator needs a narrow write
    /// seam distinct from the full `update`, since it fires far more often.
    fn touch_last_seen(
        &self,
        agent_id: u64,
        at: chrono::DateTime<chrono::Utc>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// `RuleRepository` (§6.1). Extends [`PortAvailability`] since the port
/// allocator's in-use check is one of this repository's required methods,
/// not a separate collaborator.
pub trait RuleRepository: PortAvailability {
    fn create(&self, rule: Rule) -> impl Future<Output = Result<Rule>> + Send;
    fn update(&self, rule: Rule) -> impl Future<Output = Result<Rule>> + Send;
    fn delete(&self, id: u64) -> impl Future<Output = Result<()>> + Send;
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<Rule>>> + Send;
    fn get_by_sid(&self, sid: &ShortId) -> impl Future<Output = Result<Option<Rule>>> + Send;
    fn get_by_sids(&self, sids: &[ShortId]) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list(&self) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_by_user_id(&self, user_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_by_subscription_id(&self, subscription_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_by_group_id(&self, group_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_enabled_by_agent_id(&self, agent_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_enabled_by_exit_agent_id(&self, agent_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn list_enabled_by_chain_agent_id(&self, agent_id: u64) -> impl Future<Output = Result<Vec<Rule>>> + Send;
    fn get_exit_rule_by_agent_id(&self, agent_id: u64) -> impl Future<Output = Result<Option<Rule>>> + Send;
    fn count_by_user_id(&self, user_id: u64) -> impl Future<Output = Result<u64>> + Send;
    fn count_by_subscription_id(&self, subscription_id: u64) -> impl Future<Output = Result<u64>> + Send;
    fn get_total_traffic_by_user_id(&self, user_id: u64) -> impl Future<Output = Result<u64>> + Send;
    fn update_sort_orders(&self, orders: &HashMap<u64, i32>) -> impl Future<Output = Result<()>> + Send;
}

/// `ChainRepository` (§6.1).
pub trait ChainRepository {
    fn create(&self, owner_user_id: Option<u64>, name: String) -> impl Future<Output = Result<u64>> + Send;
    fn update(&self, chain_id: u64, name: String) -> impl Future<Output = Result<()>> + Send;
    fn delete(&self, chain_id: u64) -> impl Future<Output = Result<()>> + Send;
    fn get_by_id(&self, chain_id: u64) -> impl Future<Output = Result<Option<u64>>> + Send;
    fn associate_rules(&self, chain_id: u64, rule_ids: &[u64]) -> impl Future<Output = Result<()>> + Send;
    fn get_rule_ids_by_chain_id(&self, chain_id: u64) -> impl Future<Output = Result<Vec<u64>>> + Send;
    fn list(&self, owner_user_id: Option<u64>) -> impl Future<Output = Result<Vec<u64>>> + Send;
}

/// A forward target reachable indirectly through a node reference.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u64,
    pub owner_user_id: Option<u64>,
    pub address: String,
    pub port: u16,
    pub protocol: Option<crate::domain::agent::Protocol>,
}

pub trait NodeRepository {
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<Node>>> + Send;
}

/// A plan-scoped bucket binding agents/rules to a subscription plan.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    pub id: u64,
    pub owner_user_id: Option<u64>,
    pub plan_id: u64,
}

pub trait ResourceGroupRepository {
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<ResourceGroup>>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Forward,
    Other,
}

/// A billing plan's forward-rule entitlements.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: u64,
    pub plan_type: PlanType,
    /// 0 means unlimited (§4.8).
    pub rule_limit: u64,
    /// 0 means unlimited (§4.8).
    pub traffic_limit: u64,
    /// Empty means all four rule kinds are allowed.
    pub rule_types: Vec<RuleKind>,
}

pub trait PlanRepository {
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<Plan>>> + Send;
}

/// An active billing subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub user_id: u64,
    pub plan_id: u64,
    pub active: bool,
    pub period_start: chrono::DateTime<chrono::Utc>,
    pub period_end: chrono::DateTime<chrono::Utc>,
}

pub trait SubscriptionRepository {
    fn get_by_id(&self, id: u64) -> impl Future<Output = Result<Option<Subscription>>> + Send;
    fn list_active_by_user_id(&self, user_id: u64) -> impl Future<Output = Result<Vec<Subscription>>> + Send;
}

/// Resource kind a hot/cold traffic reading refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Upload,
    Download,
}

pub trait SubscriptionUsageRepository {
    fn get_hourly_traffic(
        &self,
        subscription_ids: &[u64],
        resource_type: ResourceType,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

pub trait SubscriptionUsageStatsRepository {
    fn get_daily_traffic(
        &self,
        subscription_ids: &[u64],
        resource_type: ResourceType,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Commits a group of repository writes atomically (§5 "Database").
pub trait TransactionManager {
    fn run_in_transaction<F, Fut, T>(&self, f: F) -> impl Future<Output = Result<T>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send;
}

/// The Redis-style forward-traffic cache (C9).
pub trait ForwardTrafficCache {
    fn cleanup_rule_cache(&self, rule_id: u64) -> impl Future<Output = Result<()>> + Send;

    /// Accumulates one agent's counter report for a rule (§6.3 `POST
    /// /forward-agent-api/traffic`). Not part of §6.1's enumerated method
    /// list — the traffic POST has to land somewhere, and this cache is
    /// where every other forward-traffic figure already lives.
    fn record_rule_traffic(
        &self,
        rule_id: u64,
        upload_bytes: u64,
        download_bytes: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The hot (24h) hourly traffic cache consulted by the quota aggregator
/// (§4.8).
pub trait HourlyTrafficCache {
    fn get_total_traffic_by_subscription_ids(
        &self,
        subscription_ids: &[u64],
        resource_type: ResourceType,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Live agent status, applied unconditionally on every report (§4.7). §1
/// names "live agent/rule status" as part of the same Redis-style cache
/// that backs the traffic counters, but §6.1 doesn't spell out its shape —
/// this trait fills that gap the way the rest of C9 is specified.
pub trait AgentStatusCache {
    fn put_status(
        &self,
        agent_id: u64,
        status: crate::session::envelope::StatusReport,
    ) -> impl Future<Output = Result<()>> + Send;
    fn get_status(&self, agent_id: u64) -> impl Future<Output = Result<Option<crate::session::envelope::StatusReport>>> + Send;
}

/// Per-agent, per-rule sync/run status snapshot cache (§4.7 "Rule sync
/// status reports" — replaced atomically on every report).
pub trait RuleStatusCache {
    fn put_rule_statuses(
        &self,
        agent_id: u64,
        statuses: Vec<crate::session::envelope::RuleStatusReport>,
    ) -> impl Future<Output = Result<()>> + Send;
    fn get_rule_status(
        &self,
        agent_id: u64,
        rule_id: u64,
    ) -> impl Future<Output = Result<Option<crate::session::envelope::RuleStatusReport>>> + Send;
}
