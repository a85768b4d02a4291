//! The agent↔control-plane wire envelope (§4.5).

use serde::{Deserialize, Serialize};

use crate::domain::rule::Role;

/// The `type` discriminator of a [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Heartbeat,
    Event,
    ProbeResult,
    ConfigAck,
    Command,
    ProbeTask,
    ConfigSync,
}

/// `{ type, agent_id?, timestamp, data }` (§4.5 "Message envelope").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(message_type: MessageType, timestamp: chrono::DateTime<chrono::Utc>, data: serde_json::Value) -> Self {
        Self {
            message_type,
            agent_id: None,
            timestamp,
            data,
        }
    }
}

/// Agent → CP. System metrics, tunnel listen ports, per-rule counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub ws_listen_port: Option<u16>,
    pub tls_listen_port: Option<u16>,
    #[serde(default)]
    pub rules: Vec<RuleStatusReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Starting,
    Stopped,
    Error,
    Unknown,
}

/// One row of an agent's per-rule status snapshot (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleStatusReport {
    pub rule_id: u64,
    pub sync_status: SyncStatus,
    pub run_status: RunStatus,
    pub listen_port: Option<u16>,
    pub connections: u64,
    pub error_message: Option<String>,
    pub synced_at: chrono::DateTime<chrono::Utc>,
}

/// Agent → CP, ack for a prior `config_sync` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAck {
    pub version: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// CP → Agent, synthetic reachability check (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTask {
    pub probe_id: String,
    pub target_address: String,
    pub target_port: u16,
}

/// Agent → CP, result of an earlier [`ProbeTask`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_id: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// The per-agent role-specialized view the config sync engine projects for
/// one rule (§4.6 "Per-agent projection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSyncData {
    pub rule_id: u64,
    pub role: RuleRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_last_in_chain: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_ws_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop_connection_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleRole {
    Entry,
    Exit,
    Chain,
}

impl From<Role> for RuleRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Entry => RuleRole::Entry,
            Role::Exit => RuleRole::Exit,
            Role::Chain { .. } => RuleRole::Chain,
            Role::None => unreachable!("config sync never projects a non-participant"),
        }
    }
}

/// CP → Agent, full or incremental rule set (§4.6 "Full sync vs
/// incremental").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSync {
    pub version: u64,
    pub full_sync: bool,
    #[serde(default)]
    pub added: Vec<RuleSyncData>,
    #[serde(default)]
    pub updated: Vec<RuleSyncData>,
    #[serde(default)]
    pub removed: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_signing_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope::new(
            MessageType::Heartbeat,
            chrono::Utc::now(),
            serde_json::json!({}),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message_type, MessageType::Heartbeat);
    }

    #[test]
    fn unknown_data_shape_is_preserved_as_raw_json() {
        let envelope = Envelope::new(
            MessageType::Event,
            chrono::Utc::now(),
            serde_json::json!({"anything": "goes"}),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("anything"));
    }

    #[test]
    fn role_conversion_maps_chain_variant_down_to_the_bare_chain_role() {
        let role = Role::Chain { position: 1, is_last: false };
        assert_eq!(RuleRole::from(role), RuleRole::Chain);
    }
}
