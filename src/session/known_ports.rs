//! The last-reported tunnel listen port per agent, keyed by tunnel type
//! (§4.6 "Port-change propagation"). Populated by the status handler,
//! consulted by the config sync engine's projection context. Ws and tls
//! listeners are independent ports on the same agent, so the key carries
//! both the agent id and which tunnel the port belongs to.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::rule::TunnelType;

#[derive(Clone, Default)]
pub struct KnownWsPorts {
    ports: Arc<DashMap<(u64, TunnelType), u16>>,
}

impl KnownWsPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `port` for `(agent_id, tunnel_type)`, returning `true` if it
    /// differs from the previously cached value (the signal that drives
    /// re-fan-out).
    pub fn record(&self, agent_id: u64, tunnel_type: TunnelType, port: u16) -> bool {
        match self.ports.insert((agent_id, tunnel_type), port) {
            Some(previous) => previous != port,
            None => false,
        }
    }

    pub fn get(&self, agent_id: u64, tunnel_type: TunnelType) -> Option<u16> {
        self.ports.get(&(agent_id, tunnel_type)).map(|e| *e)
    }

    pub fn snapshot(&self) -> HashMap<(u64, TunnelType), u16> {
        self.ports.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}
