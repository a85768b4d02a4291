//! Session authentication (§4.5 "Authentication").
//!
//! On accept, the control plane extracts the bearer/query token, verifies
//! it, and binds the session to the resolved agent's internal ID. Disabled
//! agents are rejected.

use crate::domain::agent::Agent;
use crate::error::{Error, Result};
use crate::ids::token::{self, AgentToken};
use crate::repository::AgentRepository;

/// Resolves and verifies a bearer token, rejecting unknown, mismatched, or
/// disabled agents.
pub async fn authenticate<R: AgentRepository>(token: &str, server_secret: &[u8], repo: &R) -> Result<Agent> {
    let claimed_sid = token::parse_claimed_agent_id(token)
        .ok_or_else(|| Error::forbidden("malformed agent token"))?;

    let agent = repo
        .get_by_sid(&claimed_sid)
        .await?
        .ok_or_else(|| Error::forbidden("unknown agent token"))?;

    if !AgentToken::verify(token, &agent.sid, server_secret) {
        return Err(Error::forbidden("agent token signature mismatch"));
    }

    if !agent.enabled {
        return Err(Error::forbidden("agent is disabled"));
    }

    Ok(agent)
}

/// Extracts the bearer token from the WebSocket upgrade URL's `token` query
/// parameter (§6.2 `/ws/forward-agent?token=…`).
pub fn extract_token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::Agent as DomainAgent;
    use crate::ids::short_id::{Prefix, ShortId};
    use std::collections::{HashMap, HashSet};

    struct FakeAgents(std::sync::Mutex<HashMap<String, DomainAgent>>);

    impl AgentRepository for FakeAgents {
        async fn create(&self, agent: DomainAgent) -> Result<DomainAgent> {
            Ok(agent)
        }
        async fn update(&self, agent: DomainAgent) -> Result<DomainAgent> {
            Ok(agent)
        }
        async fn delete(&self, _id: u64) -> Result<()> {
            Ok(())
        }
        async fn get_by_id(&self, _id: u64) -> Result<Option<DomainAgent>> {
            Ok(None)
        }
        async fn get_by_sid(&self, sid: &ShortId) -> Result<Option<DomainAgent>> {
            Ok(self.0.lock().unwrap().get(&sid.to_string()).cloned())
        }
        async fn get_by_token_hash(&self, _token_hash: &str) -> Result<Option<DomainAgent>> {
            Ok(None)
        }
        async fn get_by_ids(&self, _ids: &[u64]) -> Result<HashMap<u64, DomainAgent>> {
            Ok(HashMap::new())
        }
        async fn get_sids_by_ids(&self, _ids: &[u64]) -> Result<HashMap<u64, ShortId>> {
            Ok(HashMap::new())
        }
        async fn list(&self) -> Result<Vec<DomainAgent>> {
            Ok(Vec::new())
        }
        async fn exists_by_name(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn touch_last_seen(&self, _agent_id: u64, _at: chrono::DateTime<chrono::Utc>) -> Result<()> {
            Ok(())
        }
    }

    fn agent(sid: ShortId, enabled: bool) -> DomainAgent {
        let mut a = DomainAgent::new(
            1,
            sid,
            "a".into(),
            String::new(),
            String::new(),
            vec![],
            HashSet::new(),
            "hash".into(),
        )
        .unwrap();
        a.enabled = enabled;
        a
    }

    #[tokio::test]
    async fn valid_token_for_an_enabled_agent_authenticates() {
        let sid = ShortId::generate_with(Prefix::Agent, || 7);
        let secret = b"secret";
        let minted = AgentToken::generate(&sid, secret);
        let mut map = HashMap::new();
        map.insert(sid.to_string(), agent(sid.clone(), true));
        let repo = FakeAgents(std::sync::Mutex::new(map));

        let resolved = authenticate(&minted.token, secret, &repo).await.unwrap();
        assert_eq!(resolved.sid, sid);
    }

    #[tokio::test]
    async fn disabled_agent_is_rejected() {
        let sid = ShortId::generate_with(Prefix::Agent, || 7);
        let secret = b"secret";
        let minted = AgentToken::generate(&sid, secret);
        let mut map = HashMap::new();
        map.insert(sid.to_string(), agent(sid.clone(), false));
        let repo = FakeAgents(std::sync::Mutex::new(map));

        let err = authenticate(&minted.token, secret, &repo).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected() {
        let sid = ShortId::generate_with(Prefix::Agent, || 7);
        let secret = b"secret";
        let minted = AgentToken::generate(&sid, secret);
        let repo = FakeAgents(std::sync::Mutex::new(HashMap::new()));

        let err = authenticate(&minted.token, secret, &repo).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn extracts_token_from_query_string() {
        assert_eq!(
            extract_token_from_query("token=fwd_fa_x_y&other=1"),
            Some("fwd_fa_x_y".to_string())
        );
        assert_eq!(extract_token_from_query("other=1"), None);
    }
}
