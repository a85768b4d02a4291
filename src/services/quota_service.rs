//! Quota aggregation (C8, §4.8).

use crate::domain::rule::RuleKind;
use crate::error::Result;
use crate::repository::{
    HourlyTrafficCache, PlanRepository, PlanType, ResourceType, RuleRepository, SubscriptionRepository,
    SubscriptionUsageStatsRepository,
};

/// Composed limits across a user's (or one subscription's) active forward
/// plans. `rule_limit`/`traffic_limit` of `0` means unlimited (§4.8 step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub rule_limit: u64,
    pub traffic_limit: u64,
    /// Empty means all four rule kinds are allowed.
    pub allowed_rule_types: Vec<RuleKind>,
}

/// Accumulates [`EffectiveLimits`] across plans one fold at a time. `None`
/// means "nothing folded in yet", distinct from a genuine `0` limit — the
/// seed itself must never be mistaken for an observed zero (§4.8 "a value of
/// 0... once observed, permanently wins").
struct LimitAccumulator {
    rule_limit: Option<u64>,
    traffic_limit: Option<u64>,
    allowed_rule_types: Vec<RuleKind>,
}

impl LimitAccumulator {
    fn new() -> Self {
        Self { rule_limit: None, traffic_limit: None, allowed_rule_types: Vec::new() }
    }

    fn fold_in(&mut self, rule_limit: u64, traffic_limit: u64, rule_types: &[RuleKind]) {
        self.rule_limit = Some(compose_limit(self.rule_limit, rule_limit));
        self.traffic_limit = Some(compose_limit(self.traffic_limit, traffic_limit));
        for kind in rule_types {
            if !self.allowed_rule_types.contains(kind) {
                self.allowed_rule_types.push(*kind);
            }
        }
    }

    fn finish(self) -> EffectiveLimits {
        EffectiveLimits {
            rule_limit: self.rule_limit.unwrap_or(0),
            traffic_limit: self.traffic_limit.unwrap_or(0),
            allowed_rule_types: self.allowed_rule_types,
        }
    }
}

fn compose_limit(current: Option<u64>, next: u64) -> u64 {
    match current {
        None => next,
        Some(0) => 0,
        Some(_) if next == 0 => 0,
        Some(cur) => cur.max(next),
    }
}

/// The narrow quota-enforcement seam `RuleCommandService` depends on, so it
/// doesn't need to thread `QuotaAggregator`'s own five repository generics
/// (§4.8 "Enforcement").
pub trait RuleQuotaCheck {
    fn check_rule_quota(&self, user_id: u64, kind: RuleKind) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageTotals {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Composes active-subscription plan limits and hot+cold traffic usage
/// (§4.8).
pub struct QuotaAggregator<S, P, R, H, C> {
    subscriptions: S,
    plans: P,
    rules: R,
    hourly_cache: H,
    daily_stats: C,
}

impl<S, P, R, H, C> QuotaAggregator<S, P, R, H, C>
where
    S: SubscriptionRepository,
    P: PlanRepository,
    R: RuleRepository,
    H: HourlyTrafficCache,
    C: SubscriptionUsageStatsRepository,
{
    pub fn new(subscriptions: S, plans: P, rules: R, hourly_cache: H, daily_stats: C) -> Self {
        Self { subscriptions, plans, rules, hourly_cache, daily_stats }
    }

    /// Effective limits across every active forward subscription for `user_id`
    /// (§4.8 steps 1-3).
    pub async fn effective_limits_for_user(&self, user_id: u64) -> Result<EffectiveLimits> {
        let active = self.subscriptions.list_active_by_user_id(user_id).await?;
        let mut limits = LimitAccumulator::new();
        let mut any_forward = false;

        for subscription in &active {
            let Some(plan) = self.plans.get_by_id(subscription.plan_id).await? else { continue };
            if plan.plan_type != PlanType::Forward {
                continue;
            }
            any_forward = true;
            limits.fold_in(plan.rule_limit, plan.traffic_limit, &plan.rule_types);
        }

        if !any_forward {
            return Ok(EffectiveLimits { rule_limit: 0, traffic_limit: 0, allowed_rule_types: Vec::new() });
        }
        Ok(limits.finish())
    }

    /// Same computation restricted to one subscription (§4.8 "For a
    /// subscription").
    pub async fn effective_limits_for_subscription(&self, subscription_id: u64) -> Result<Option<EffectiveLimits>> {
        let Some(subscription) = self.subscriptions.get_by_id(subscription_id).await? else { return Ok(None) };
        let Some(plan) = self.plans.get_by_id(subscription.plan_id).await? else { return Ok(None) };
        if plan.plan_type != PlanType::Forward {
            return Ok(None);
        }
        Ok(Some(EffectiveLimits {
            rule_limit: plan.rule_limit,
            traffic_limit: plan.traffic_limit,
            allowed_rule_types: plan.rule_types,
        }))
    }

    pub async fn rule_count_for_user(&self, user_id: u64) -> Result<u64> {
        self.rules.count_by_user_id(user_id).await
    }

    pub async fn rule_count_for_subscription(&self, subscription_id: u64) -> Result<u64> {
        self.rules.count_by_subscription_id(subscription_id).await
    }

    /// Sums hot (24h cache) and cold (daily stats) traffic across every
    /// active forward subscription's current period (§4.8 step 5).
    pub async fn traffic_usage_for_user(&self, user_id: u64) -> Result<UsageTotals> {
        let active = self.subscriptions.list_active_by_user_id(user_id).await?;
        let mut forward_ids = Vec::new();
        let mut earliest_start = None;
        let mut latest_end = None;

        for subscription in &active {
            let Some(plan) = self.plans.get_by_id(subscription.plan_id).await? else { continue };
            if plan.plan_type != PlanType::Forward {
                continue;
            }
            forward_ids.push(subscription.id);
            earliest_start = Some(earliest_start.map_or(subscription.period_start, |e: chrono::DateTime<chrono::Utc>| e.min(subscription.period_start)));
            latest_end = Some(latest_end.map_or(subscription.period_end, |l: chrono::DateTime<chrono::Utc>| l.max(subscription.period_end)));
        }

        if forward_ids.is_empty() {
            return Ok(UsageTotals { upload_bytes: 0, download_bytes: 0 });
        }
        let from = earliest_start.unwrap();
        let to = latest_end.unwrap();
        let hot_cutoff = chrono::Utc::now() - chrono::Duration::hours(24);

        let mut upload = self.hourly_cache.get_total_traffic_by_subscription_ids(&forward_ids, ResourceType::Upload, hot_cutoff, to).await?;
        upload += self.daily_stats.get_daily_traffic(&forward_ids, ResourceType::Upload, from, hot_cutoff).await?;

        let mut download = self.hourly_cache.get_total_traffic_by_subscription_ids(&forward_ids, ResourceType::Download, hot_cutoff, to).await?;
        download += self.daily_stats.get_daily_traffic(&forward_ids, ResourceType::Download, from, hot_cutoff).await?;

        Ok(UsageTotals { upload_bytes: upload, download_bytes: download })
    }
}

impl<S, P, R, H, C> RuleQuotaCheck for QuotaAggregator<S, P, R, H, C>
where
    S: SubscriptionRepository + Sync,
    P: PlanRepository + Sync,
    R: RuleRepository + Sync,
    H: HourlyTrafficCache + Sync,
    C: SubscriptionUsageStatsRepository + Sync,
{
    /// Defense-in-depth check run inside the create transaction just before
    /// persistence (§4.8 "Enforcement").
    async fn check_rule_quota(&self, user_id: u64, kind: RuleKind) -> Result<()> {
        let limits = self.effective_limits_for_user(user_id).await?;
        if !limits.allowed_rule_types.is_empty() && !limits.allowed_rule_types.contains(&kind) {
            return Err(crate::error::Error::forbidden(format!(
                "plan does not permit rule kind {kind:?}"
            )));
        }
        if limits.rule_limit == 0 {
            return Ok(());
        }
        let count = self.rule_count_for_user(user_id).await?;
        if count >= limits.rule_limit {
            return Err(crate::error::Error::conflict("rule quota exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{Plan, Subscription};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeSubs(Vec<Subscription>);
    impl SubscriptionRepository for FakeSubs {
        async fn get_by_id(&self, id: u64) -> Result<Option<Subscription>> {
            Ok(self.0.iter().find(|s| s.id == id).cloned())
        }
        async fn list_active_by_user_id(&self, user_id: u64) -> Result<Vec<Subscription>> {
            Ok(self.0.iter().filter(|s| s.user_id == user_id && s.active).cloned().collect())
        }
    }

    struct FakePlans(Vec<Plan>);
    impl PlanRepository for FakePlans {
        async fn get_by_id(&self, id: u64) -> Result<Option<Plan>> {
            Ok(self.0.iter().find(|p| p.id == id).cloned())
        }
    }

    #[derive(Default)]
    struct FakeRules {
        rule_count: Mutex<HashMap<u64, u64>>,
    }
    impl crate::domain::port_allocator::PortAvailability for FakeRules {
        async fn is_port_in_use_by_agent(&self, _agent_id: u64, _port: u16, _exclude: Option<u64>) -> Result<bool> {
            Ok(false)
        }
    }
    impl RuleRepository for FakeRules {
        async fn create(&self, rule: crate::domain::rule::Rule) -> Result<crate::domain::rule::Rule> { Ok(rule) }
        async fn update(&self, rule: crate::domain::rule::Rule) -> Result<crate::domain::rule::Rule> { Ok(rule) }
        async fn delete(&self, _id: u64) -> Result<()> { Ok(()) }
        async fn get_by_id(&self, _id: u64) -> Result<Option<crate::domain::rule::Rule>> { Ok(None) }
        async fn get_by_sid(&self, _sid: &crate::ids::short_id::ShortId) -> Result<Option<crate::domain::rule::Rule>> { Ok(None) }
        async fn get_by_sids(&self, _sids: &[crate::ids::short_id::ShortId]) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list(&self) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_by_user_id(&self, _user_id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_by_subscription_id(&self, _id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_by_group_id(&self, _id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_enabled_by_agent_id(&self, _id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_enabled_by_exit_agent_id(&self, _id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn list_enabled_by_chain_agent_id(&self, _id: u64) -> Result<Vec<crate::domain::rule::Rule>> { Ok(Vec::new()) }
        async fn get_exit_rule_by_agent_id(&self, _id: u64) -> Result<Option<crate::domain::rule::Rule>> { Ok(None) }
        async fn count_by_user_id(&self, user_id: u64) -> Result<u64> {
            Ok(*self.rule_count.lock().unwrap().get(&user_id).unwrap_or(&0))
        }
        async fn count_by_subscription_id(&self, _id: u64) -> Result<u64> { Ok(0) }
        async fn get_total_traffic_by_user_id(&self, _id: u64) -> Result<u64> { Ok(0) }
        async fn update_sort_orders(&self, _orders: &HashMap<u64, i32>) -> Result<()> { Ok(()) }
    }

    struct FakeHourly;
    impl HourlyTrafficCache for FakeHourly {
        async fn get_total_traffic_by_subscription_ids(&self, _ids: &[u64], _rt: ResourceType, _from: chrono::DateTime<chrono::Utc>, _to: chrono::DateTime<chrono::Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    struct FakeDaily;
    impl SubscriptionUsageStatsRepository for FakeDaily {
        async fn get_daily_traffic(&self, _ids: &[u64], _rt: ResourceType, _from: chrono::DateTime<chrono::Utc>, _to: chrono::DateTime<chrono::Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    fn subscription(id: u64, user_id: u64, plan_id: u64) -> Subscription {
        Subscription {
            id,
            user_id,
            plan_id,
            active: true,
            period_start: chrono::Utc::now() - chrono::Duration::days(10),
            period_end: chrono::Utc::now() + chrono::Duration::days(20),
        }
    }

    fn plan(id: u64, rule_limit: u64) -> Plan {
        Plan { id, plan_type: PlanType::Forward, rule_limit, traffic_limit: 0, rule_types: Vec::new() }
    }

    #[tokio::test]
    async fn a_zero_limit_permanently_wins_over_a_nonzero_one() {
        let subs = FakeSubs(vec![subscription(1, 1, 10), subscription(2, 1, 20)]);
        let plans = FakePlans(vec![plan(10, 100), plan(20, 0)]);
        let agg = QuotaAggregator::new(subs, plans, FakeRules::default(), FakeHourly, FakeDaily);
        let limits = agg.effective_limits_for_user(1).await.unwrap();
        assert_eq!(limits.rule_limit, 0);
    }

    #[tokio::test]
    async fn two_nonzero_limits_compose_via_max_not_zero() {
        let subs = FakeSubs(vec![subscription(1, 1, 10), subscription(2, 1, 20)]);
        let plans = FakePlans(vec![plan(10, 100), plan(20, 50)]);
        let agg = QuotaAggregator::new(subs, plans, FakeRules::default(), FakeHourly, FakeDaily);
        let limits = agg.effective_limits_for_user(1).await.unwrap();
        assert_eq!(limits.rule_limit, 100);
    }

    #[tokio::test]
    async fn non_forward_plans_are_excluded_from_composition() {
        let subs = FakeSubs(vec![subscription(1, 1, 10)]);
        let mut other = plan(10, 50);
        other.plan_type = PlanType::Other;
        let plans = FakePlans(vec![other]);
        let agg = QuotaAggregator::new(subs, plans, FakeRules::default(), FakeHourly, FakeDaily);
        let limits = agg.effective_limits_for_user(1).await.unwrap();
        assert_eq!(limits.rule_limit, 0);
        assert!(limits.allowed_rule_types.is_empty());
    }

    #[tokio::test]
    async fn quota_check_rejects_when_count_meets_the_limit() {
        let subs = FakeSubs(vec![subscription(1, 1, 10)]);
        let plans = FakePlans(vec![plan(10, 5)]);
        let rules = FakeRules::default();
        rules.rule_count.lock().unwrap().insert(1, 5);
        let agg = QuotaAggregator::new(subs, plans, rules, FakeHourly, FakeDaily);
        let err = agg.check_rule_quota(1, RuleKind::Direct).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Conflict(_)));
    }
}
