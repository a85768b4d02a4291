//! # forward-control-plane
//!
//! Core of the control plane for a fleet of distributed network forwarding
//! agents. Agents terminate user-visible listeners, relay TCP/UDP traffic
//! directly or through multi-hop tunnels to targets, and continuously
//! negotiate their runtime configuration with this control plane over a
//! persistent WebSocket session.
//!
//! This crate is the core only: persistence, the key-value cache, the
//! admin-facing HTTP/REST routing layer, end-user authentication, billing,
//! the agent's own data-plane forwarder, and the probe executor are external
//! collaborators reached through the trait contracts in [`repository`].
//!
//! ## Layout
//!
//! - [`ids`] — Stripe-style short IDs and HMAC agent tokens (C1)
//! - [`domain`] — rule/agent invariants, port allocation (C2, C3)
//! - [`repository`] — contracts this core depends on (C9)
//! - [`memory`] — `DashMap`-backed reference implementations of those
//!   contracts, good enough to run the binary end to end; not the
//!   persistence layer a deployment would actually run against
//! - [`session`] — the live per-agent WebSocket session layer (C5)
//! - [`sync`] — the config fan-out engine (C6)
//! - [`services`] — rule command service, quota aggregator, status aggregator (C4, C7, C8)
//! - [`websocket_handler`] — the axum entrypoint that accepts agent connections
//! - [`rest`] — the agent-facing REST fallback (§6.3)

pub mod config;
pub mod error;
pub mod ids;
pub mod observability;
pub mod repository;

pub mod domain;
pub mod memory;
pub mod services;
pub mod session;
pub mod sync;

pub mod rest;
pub mod websocket_handler;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::agent::{Agent, BlockedProtocol, IpVersion, PortRange, Protocol};
    pub use crate::domain::port_allocator::PortAllocator;
    pub use crate::domain::rule::{LoadBalanceStrategy, Rule, RuleKind, RuleStatus, RuleTarget};
    pub use crate::error::{Error, Result};
    pub use crate::ids::short_id::{Prefix, ShortId};
    pub use crate::ids::token::AgentToken;
    pub use crate::services::quota_service::QuotaAggregator;
    pub use crate::services::rule_service::RuleCommandService;
    pub use crate::services::status_service::StatusAggregator;
    pub use crate::session::registry::SessionRegistry;
    pub use crate::sync::engine::ConfigSyncEngine;
}
