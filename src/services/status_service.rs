//! Status & telemetry aggregation (C7, §4.7).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::domain::rule::Rule;
use crate::error::Result;
use crate::repository::{AgentRepository, AgentStatusCache, RuleStatusCache};
use crate::session::envelope::{RunStatus, StatusReport, SyncStatus};

struct LastSeenEntry {
    written_at: Instant,
    version: Option<String>,
    platform: Option<String>,
    arch: Option<String>,
}

/// Aggregated per-rule health view for operator reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHealth {
    pub rule_id: u64,
    pub sync_status: SyncStatus,
    pub run_status: RunStatus,
    pub healthy_participants: usize,
    pub total_participants: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Merges per-agent status reports into rule-level health, rate-limiting the
/// last-seen write path (§4.7).
pub struct StatusAggregator<C, A> {
    cache: C,
    agents: A,
    last_seen: RwLock<HashMap<u64, LastSeenEntry>>,
    rate_limit: Duration,
}

impl<C, A> StatusAggregator<C, A>
where
    C: AgentStatusCache + RuleStatusCache,
    A: AgentRepository,
{
    pub fn new(cache: C, agents: A, rate_limit: Duration) -> Self {
        Self {
            cache,
            agents,
            last_seen: RwLock::new(HashMap::new()),
            rate_limit,
        }
    }

    /// Applies one agent's `status` report: cache is updated unconditionally;
    /// the last-seen DB write is rate-limited unless identity fields changed
    /// (§4.7 "Agent status reports").
    pub async fn apply_status_report(&self, agent_id: u64, report: StatusReport) -> Result<()> {
        let rule_statuses = report.rules.clone();

        if self.should_write_last_seen(agent_id, &report) {
            self.agents.touch_last_seen(agent_id, chrono::Utc::now()).await?;
        }

        self.cache.put_status(agent_id, report).await?;
        self.cache.put_rule_statuses(agent_id, rule_statuses).await?;
        Ok(())
    }

    fn should_write_last_seen(&self, agent_id: u64, report: &StatusReport) -> bool {
        let mut guard = self.last_seen.write().unwrap();
        let now = Instant::now();
        let identity_changed = match guard.get(&agent_id) {
            Some(entry) => entry.version != report.version || entry.platform != report.platform || entry.arch != report.arch,
            None => true,
        };
        let elapsed = guard
            .get(&agent_id)
            .map(|entry| now.duration_since(entry.written_at) >= self.rate_limit)
            .unwrap_or(true);

        if identity_changed || elapsed {
            guard.insert(
                agent_id,
                LastSeenEntry {
                    written_at: now,
                    version: report.version.clone(),
                    platform: report.platform.clone(),
                    arch: report.arch.clone(),
                },
            );
            true
        } else {
            false
        }
    }

    /// Aggregates one rule's health across its current participant set
    /// (§4.6's participant rule). Disabled rules are never aggregated — they
    /// are intentionally unsynced (§4.7).
    pub async fn aggregate_rule_status(&self, rule: &Rule) -> Result<Option<RuleHealth>> {
        if !rule.is_enabled() {
            return Ok(None);
        }

        let participants = rule.participant_agent_ids();
        if participants.is_empty() {
            return Ok(None);
        }

        let mut worst_sync = SyncStatus::Synced;
        let mut worst_run = RunStatus::Unknown;
        let mut healthy = 0usize;
        let mut latest: Option<chrono::DateTime<chrono::Utc>> = None;

        for agent_id in &participants {
            let reported = self.cache.get_rule_status(*agent_id, rule.id).await?;
            let (sync_status, run_status, has_error, synced_at) = match &reported {
                Some(status) => (
                    status.sync_status,
                    status.run_status,
                    status.error_message.is_some(),
                    Some(status.synced_at),
                ),
                None => (SyncStatus::Pending, RunStatus::Unknown, false, None),
            };

            if sync_rank(sync_status) > sync_rank(worst_sync) {
                worst_sync = sync_status;
            }
            if run_rank(run_status) > run_rank(worst_run) {
                worst_run = run_status;
            }
            if matches!(sync_status, SyncStatus::Synced) && matches!(run_status, RunStatus::Running) && !has_error {
                healthy += 1;
            }
            if let Some(at) = synced_at {
                latest = Some(latest.map_or(at, |current| current.max(at)));
            }
        }

        Ok(Some(RuleHealth {
            rule_id: rule.id,
            sync_status: worst_sync,
            run_status: worst_run,
            healthy_participants: healthy,
            total_participants: participants.len(),
            updated_at: latest.unwrap_or_else(chrono::Utc::now),
        }))
    }
}

fn sync_rank(status: SyncStatus) -> u8 {
    match status {
        SyncStatus::Synced => 0,
        SyncStatus::Pending => 1,
        SyncStatus::Failed => 2,
    }
}

fn run_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Unknown => 0,
        RunStatus::Running => 1,
        RunStatus::Starting => 2,
        RunStatus::Stopped => 3,
        RunStatus::Error => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{IpVersion, Protocol};
    use crate::domain::rule::{ExitTarget, RuleKind, RuleStatus, RuleTarget};
    use crate::ids::short_id::{Prefix, ShortId};
    use crate::session::envelope::RuleStatusReport;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCache {
        statuses: Mutex<Map<u64, StatusReport>>,
        rule_statuses: Mutex<Map<(u64, u64), RuleStatusReport>>,
    }

    impl AgentStatusCache for FakeCache {
        async fn put_status(&self, agent_id: u64, status: StatusReport) -> Result<()> {
            self.statuses.lock().unwrap().insert(agent_id, status);
            Ok(())
        }
        async fn get_status(&self, agent_id: u64) -> Result<Option<StatusReport>> {
            Ok(self.statuses.lock().unwrap().get(&agent_id).cloned())
        }
    }

    impl RuleStatusCache for FakeCache {
        async fn put_rule_statuses(&self, agent_id: u64, statuses: Vec<RuleStatusReport>) -> Result<()> {
            let mut guard = self.rule_statuses.lock().unwrap();
            guard.retain(|(a, _), _| *a != agent_id);
            for status in statuses {
                guard.insert((agent_id, status.rule_id), status);
            }
            Ok(())
        }
        async fn get_rule_status(&self, agent_id: u64, rule_id: u64) -> Result<Option<RuleStatusReport>> {
            Ok(self.rule_statuses.lock().unwrap().get(&(agent_id, rule_id)).cloned())
        }
    }

    #[derive(Default)]
    struct FakeAgents {
        touched: Mutex<Vec<u64>>,
    }

    impl AgentRepository for FakeAgents {
        async fn create(&self, agent: crate::domain::agent::Agent) -> Result<crate::domain::agent::Agent> {
            Ok(agent)
        }
        async fn update(&self, agent: crate::domain::agent::Agent) -> Result<crate::domain::agent::Agent> {
            Ok(agent)
        }
        async fn delete(&self, _id: u64) -> Result<()> {
            Ok(())
        }
        async fn get_by_id(&self, _id: u64) -> Result<Option<crate::domain::agent::Agent>> {
            Ok(None)
        }
        async fn get_by_sid(&self, _sid: &ShortId) -> Result<Option<crate::domain::agent::Agent>> {
            Ok(None)
        }
        async fn get_by_token_hash(&self, _token_hash: &str) -> Result<Option<crate::domain::agent::Agent>> {
            Ok(None)
        }
        async fn get_by_ids(&self, _ids: &[u64]) -> Result<Map<u64, crate::domain::agent::Agent>> {
            Ok(Map::new())
        }
        async fn get_sids_by_ids(&self, _ids: &[u64]) -> Result<Map<u64, ShortId>> {
            Ok(Map::new())
        }
        async fn list(&self) -> Result<Vec<crate::domain::agent::Agent>> {
            Ok(Vec::new())
        }
        async fn exists_by_name(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn touch_last_seen(&self, agent_id: u64, _at: chrono::DateTime<chrono::Utc>) -> Result<()> {
            self.touched.lock().unwrap().push(agent_id);
            Ok(())
        }
    }

    fn status(rules: Vec<RuleStatusReport>) -> StatusReport {
        StatusReport {
            version: Some("1.0.0".into()),
            platform: Some("linux".into()),
            arch: Some("x86_64".into()),
            ws_listen_port: Some(9000),
            tls_listen_port: None,
            rules,
        }
    }

    fn rule_row(rule_id: u64, sync: SyncStatus, run: RunStatus) -> RuleStatusReport {
        RuleStatusReport {
            rule_id,
            sync_status: sync,
            run_status: run,
            listen_port: None,
            connections: 0,
            error_message: None,
            synced_at: chrono::Utc::now(),
        }
    }

    fn entry_rule(entry: u64, exit: u64) -> Rule {
        Rule {
            id: 1,
            sid: ShortId::generate_with(Prefix::Rule, || 1),
            user_id: None,
            subscription_id: None,
            kind: RuleKind::Entry,
            name: "r".into(),
            agent_id: Some(entry),
            listen_port: 8081,
            target: Some(RuleTarget::Static { address: "10.0.0.1".into(), port: 80 }),
            exit: Some(ExitTarget::Single(exit)),
            load_balance_strategy: Default::default(),
            chain_agent_ids: vec![],
            chain_port_config: Default::default(),
            tunnel_type: None,
            tunnel_hops: None,
            status: RuleStatus::Enabled,
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

    #[tokio::test]
    async fn first_report_always_writes_last_seen() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        agg.apply_status_report(1, status(vec![])).await.unwrap();
        assert_eq!(agg.agents.touched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rapid_second_report_with_same_identity_is_rate_limited() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        agg.apply_status_report(1, status(vec![])).await.unwrap();
        agg.apply_status_report(1, status(vec![])).await.unwrap();
        assert_eq!(agg.agents.touched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn version_change_bypasses_the_rate_limit() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        agg.apply_status_report(1, status(vec![])).await.unwrap();
        let mut upgraded = status(vec![]);
        upgraded.version = Some("1.0.1".into());
        agg.apply_status_report(1, upgraded).await.unwrap();
        assert_eq!(agg.agents.touched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disabled_rule_is_skipped() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        let mut rule = entry_rule(1, 2);
        rule.status = RuleStatus::Disabled;
        assert!(agg.aggregate_rule_status(&rule).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_reporting_participant_defaults_to_pending_unknown() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        let rule = entry_rule(1, 2);
        let health = agg.aggregate_rule_status(&rule).await.unwrap().unwrap();
        assert_eq!(health.sync_status, SyncStatus::Pending);
        assert_eq!(health.run_status, RunStatus::Unknown);
        assert_eq!(health.healthy_participants, 0);
        assert_eq!(health.total_participants, 2);
    }

    #[tokio::test]
    async fn worst_status_wins_across_participants() {
        let agg = StatusAggregator::new(FakeCache::default(), FakeAgents::default(), Duration::from_secs(120));
        let rule = entry_rule(1, 2);
        agg.cache
            .put_rule_statuses(1, vec![rule_row(1, SyncStatus::Synced, RunStatus::Running)])
            .await
            .unwrap();
        agg.cache
            .put_rule_statuses(2, vec![rule_row(1, SyncStatus::Failed, RunStatus::Error)])
            .await
            .unwrap();

        let health = agg.aggregate_rule_status(&rule).await.unwrap().unwrap();
        assert_eq!(health.sync_status, SyncStatus::Failed);
        assert_eq!(health.run_status, RunStatus::Error);
        assert_eq!(health.healthy_participants, 1);
    }
}
