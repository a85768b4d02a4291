//! External collaborator contracts this core depends on (C9, §6.1).
//!
//! Persistence, the key-value cache, and the transaction boundary are out of
//! scope for this crate — they're implemented elsewhere and reached only
//! through the traits in [`contracts`]. Everything here is signature only.

mod contracts;

pub use contracts::{
    AgentRepository, AgentStatusCache, ChainRepository, ForwardTrafficCache, HourlyTrafficCache,
    Node, NodeRepository, Plan, PlanRepository, PlanType, ResourceGroup, ResourceGroupRepository,
    ResourceType, RuleRepository, RuleStatusCache, Subscription, SubscriptionRepository,
    SubscriptionUsageRepository, SubscriptionUsageStatsRepository, TransactionManager,
};
