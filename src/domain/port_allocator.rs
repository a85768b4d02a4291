//! Per-agent port allocation with retry on conflict (C3, §4.3).

use rand::Rng;

use crate::domain::agent::Agent;
use crate::error::{Error, Result};

/// The repository-backed check the allocator consults before committing to a
/// candidate port. Implemented by the persistence collaborator (out of scope
/// here); chain-port-config entries of *other* rules must count as in-use.
pub trait PortAvailability {
    fn is_port_in_use_by_agent(
        &self,
        agent_id: u64,
        port: u16,
        exclude_rule_id: Option<u64>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}

pub struct PortAllocator {
    pub max_attempts: u32,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self { max_attempts: 100 }
    }
}

impl PortAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// `AssignAvailablePort` (§4.3): samples from the agent's allowed ranges
    /// (or the default pool), defensively re-checks `is_port_allowed`, and
    /// asks the repository whether the candidate is already in use. Retries
    /// up to `max_attempts` times before failing with `Validation`.
    pub async fn assign_available_port<R: PortAvailability>(
        &self,
        agent: &Agent,
        checker: &R,
        exclude_rule_id: Option<u64>,
    ) -> Result<u16> {
        let pool = agent.assignment_pool();
        let total: u32 = pool.iter().map(|r| u32::from(r.end) - u32::from(r.start) + 1).sum();
        if total == 0 {
            return Err(Error::validation("agent has no assignable ports"));
        }

        for _ in 0..self.max_attempts {
            let candidate = sample_from_pool(&pool, total, || rand::rng().random_range(0..total));
            if !agent.is_port_allowed(candidate) {
                continue;
            }
            if !checker
                .is_port_in_use_by_agent(agent.id, candidate, exclude_rule_id)
                .await?
            {
                return Ok(candidate);
            }
        }

        Err(Error::validation("no available port after exhausting allocation attempts"))
    }

    /// Test/deterministic variant driven by a caller-supplied index source
    /// instead of the global RNG.
    pub async fn assign_available_port_with<R: PortAvailability>(
        &self,
        agent: &Agent,
        checker: &R,
        exclude_rule_id: Option<u64>,
        mut next_index: impl FnMut(u32) -> u32,
    ) -> Result<u16> {
        let pool = agent.assignment_pool();
        let total: u32 = pool.iter().map(|r| u32::from(r.end) - u32::from(r.start) + 1).sum();
        if total == 0 {
            return Err(Error::validation("agent has no assignable ports"));
        }

        for _ in 0..self.max_attempts {
            let idx = next_index(total);
            let candidate = sample_from_pool(&pool, total, || idx);
            if !agent.is_port_allowed(candidate) {
                continue;
            }
            if !checker
                .is_port_in_use_by_agent(agent.id, candidate, exclude_rule_id)
                .await?
            {
                return Ok(candidate);
            }
        }

        Err(Error::validation("no available port after exhausting allocation attempts"))
    }
}

fn sample_from_pool(pool: &[crate::domain::agent::PortRange], total: u32, mut index_source: impl FnMut() -> u32) -> u16 {
    let mut index = index_source() % total;
    for range in pool {
        let width = u32::from(range.end) - u32::from(range.start) + 1;
        if index < width {
            return range.start + index as u16;
        }
        index -= width;
    }
    unreachable!("index computed modulo total must land within the pool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::short_id::{Prefix, ShortId};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn agent_with_ranges(ranges: Vec<crate::domain::agent::PortRange>) -> Agent {
        Agent::new(
            1,
            ShortId::generate_with(Prefix::Agent, || 1),
            "a".into(),
            String::new(),
            String::new(),
            ranges,
            HashSet::new(),
            "hash".into(),
        )
        .unwrap()
    }

    struct FakeRepo {
        used: Mutex<HashMap<(u64, u16), ()>>,
    }

    impl PortAvailability for FakeRepo {
        async fn is_port_in_use_by_agent(
            &self,
            agent_id: u64,
            port: u16,
            _exclude_rule_id: Option<u64>,
        ) -> Result<bool> {
            Ok(self.used.lock().unwrap().contains_key(&(agent_id, port)))
        }
    }

    #[tokio::test]
    async fn assigns_a_port_within_the_agents_range() {
        let range = crate::domain::agent::PortRange::new(9000, 9010).unwrap();
        let agent = agent_with_ranges(vec![range]);
        let repo = FakeRepo { used: Mutex::new(HashMap::new()) };
        let allocator = PortAllocator::default();
        let port = allocator
            .assign_available_port_with(&agent, &repo, None, |total| total / 2)
            .await
            .unwrap();
        assert!(range.contains(port));
    }

    #[tokio::test]
    async fn skips_ports_already_in_use() {
        let range = crate::domain::agent::PortRange::new(9000, 9002).unwrap();
        let agent = agent_with_ranges(vec![range]);
        let mut used = HashMap::new();
        used.insert((1, 9000), ());
        let repo = FakeRepo { used: Mutex::new(used) };
        let allocator = PortAllocator::default();
        let mut calls = 0u32;
        let port = allocator
            .assign_available_port_with(&agent, &repo, None, |total| {
                let v = calls % total;
                calls += 1;
                v
            })
            .await
            .unwrap();
        assert_ne!(port, 9000);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_validation_error() {
        let range = crate::domain::agent::PortRange::new(9000, 9000).unwrap();
        let agent = agent_with_ranges(vec![range]);
        let mut used = HashMap::new();
        used.insert((1, 9000), ());
        let repo = FakeRepo { used: Mutex::new(used) };
        let allocator = PortAllocator::new(3);
        let err = allocator
            .assign_available_port_with(&agent, &repo, None, |_total| 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn defaults_to_the_well_known_pool_when_agent_declares_no_ranges() {
        let agent = agent_with_ranges(vec![]);
        let repo = FakeRepo { used: Mutex::new(HashMap::new()) };
        let allocator = PortAllocator::default();
        let port = allocator
            .assign_available_port_with(&agent, &repo, None, |total| total / 3)
            .await
            .unwrap();
        assert!(crate::domain::agent::DEFAULT_PORT_POOL.contains(port));
    }
}
