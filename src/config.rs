//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `FCP_`)
//! 2. Current working directory: `./config.toml`
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Root configuration for the control plane core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub ports: PortPoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    pub secrets: SecretsConfig,
}

/// Server-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Port-pool bounds used by the port allocator (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPoolConfig {
    #[serde(default = "default_port_pool_min")]
    pub min: u16,
    #[serde(default = "default_port_pool_max")]
    pub max: u16,
    #[serde(default = "default_port_allocation_attempts")]
    pub allocation_attempts: u32,
    #[serde(default = "default_create_retry_attempts")]
    pub create_retry_attempts: u32,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            min: default_port_pool_min(),
            max: default_port_pool_max(),
            allocation_attempts: default_port_allocation_attempts(),
            create_retry_attempts: default_create_retry_attempts(),
        }
    }
}

/// WebSocket session timing (§5 Timeouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            write_deadline_secs: default_write_deadline_secs(),
            send_queue_depth: default_send_queue_depth(),
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

/// Config sync engine batching/backoff limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_resync_backoff_secs")]
    pub resync_backoff_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            resync_backoff_secs: default_resync_backoff_secs(),
        }
    }
}

/// Status/quota aggregation rate limits (§4.7, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_last_seen_rate_limit_secs")]
    pub last_seen_rate_limit_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            last_seen_rate_limit_secs: default_last_seen_rate_limit_secs(),
        }
    }
}

impl QuotaConfig {
    pub fn last_seen_rate_limit(&self) -> Duration {
        Duration::from_secs(self.last_seen_rate_limit_secs)
    }
}

/// Secrets used by the HMAC agent-token scheme (C1).
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Server-side HMAC signing key. Never logged or displayed.
    pub agent_token_secret: String,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("agent_token_secret", &"<redacted>")
            .finish()
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_port_pool_min() -> u16 {
    10000
}

fn default_port_pool_max() -> u16 {
    60000
}

fn default_port_allocation_attempts() -> u32 {
    100
}

fn default_create_retry_attempts() -> u32 {
    3
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_write_deadline_secs() -> u64 {
    10
}

fn default_send_queue_depth() -> usize {
    256
}

fn default_batch_limit() -> usize {
    500
}

fn default_resync_backoff_secs() -> u64 {
    5
}

fn default_last_seen_rate_limit_secs() -> u64 {
    120
}

impl Config {
    /// Loads configuration from `./config.toml` (if present) layered under
    /// `FCP_`-prefixed environment variables, falling back to defaults for
    /// every field that has one.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(defaults()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FCP_").split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| crate::error::Error::Internal(format!("failed to load config: {e}")))?;
        Ok(config)
    }
}

fn defaults() -> serde_json::Value {
    serde_json::json!({
        "server": {
            "bind_address": default_bind_address(),
            "port": default_port(),
            "log_level": default_log_level(),
            "environment": default_environment(),
        },
        "secrets": {
            "agent_token_secret": "",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_pool_defaults_match_spec() {
        let pool = PortPoolConfig::default();
        assert_eq!(pool.min, 10000);
        assert_eq!(pool.max, 60000);
        assert_eq!(pool.allocation_attempts, 100);
        assert_eq!(pool.create_retry_attempts, 3);
    }

    #[test]
    fn session_timing_defaults_match_spec() {
        let session = SessionConfig::default();
        assert_eq!(session.ping_interval(), Duration::from_secs(30));
        assert_eq!(session.pong_wait(), Duration::from_secs(60));
        assert_eq!(session.write_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn quota_rate_limit_default_is_two_minutes() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.last_seen_rate_limit(), Duration::from_secs(120));
    }

    #[test]
    fn secrets_debug_never_prints_the_key() {
        let secrets = SecretsConfig {
            agent_token_secret: "super-secret".to_string(),
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
