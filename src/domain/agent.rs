//! Agent entity and its invariants (C2, §3 "Agent").

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::ids::short_id::ShortId;

/// Transport protocol a rule or block-list entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

/// Subset of [`Protocol`] an agent can block outright (`both` is not a valid
/// block-list entry — you block tcp and udp individually).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockedProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    Auto,
    Ipv4,
    Ipv6,
}

/// A closed, inclusive port interval within `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || end == 0 {
            return Err(Error::validation("port range bounds must be within 1..65535"));
        }
        if start > end {
            return Err(Error::validation("port range start must not exceed end"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Default auto-assignment pool used when an agent declares no explicit
/// allowed ranges (§3, §4.3).
pub const DEFAULT_PORT_POOL: PortRange = PortRange {
    start: 10_000,
    end: 60_000,
};

/// A remotely installed forwarder (§3 "Agent").
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: u64,
    pub sid: ShortId,
    pub name: String,
    pub public_address: String,
    pub tunnel_address: String,
    allowed_port_ranges: Vec<PortRange>,
    pub blocked_protocols: HashSet<BlockedProtocol>,
    pub mute_notifications: bool,
    pub resource_group_ids: Vec<u64>,
    pub token_hash: String,
    pub enabled: bool,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub renewal_amount: Option<u64>,
}

impl Agent {
    /// Constructs a new agent, validating the port-range invariant from §3:
    /// each interval within `1..65535`, and intervals pairwise disjoint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        sid: ShortId,
        name: String,
        public_address: String,
        tunnel_address: String,
        allowed_port_ranges: Vec<PortRange>,
        blocked_protocols: HashSet<BlockedProtocol>,
        token_hash: String,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::validation("agent name must not be empty"));
        }
        Self::validate_disjoint(&allowed_port_ranges)?;
        Ok(Self {
            id,
            sid,
            name,
            public_address,
            tunnel_address,
            allowed_port_ranges,
            blocked_protocols,
            mute_notifications: false,
            resource_group_ids: Vec::new(),
            token_hash,
            enabled: true,
            expires_at: None,
            renewal_amount: None,
        })
    }

    fn validate_disjoint(ranges: &[PortRange]) -> Result<()> {
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::validation(
                        "agent allowed port ranges must be pairwise disjoint",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn allowed_port_ranges(&self) -> &[PortRange] {
        &self.allowed_port_ranges
    }

    pub fn set_allowed_port_ranges(&mut self, ranges: Vec<PortRange>) -> Result<()> {
        Self::validate_disjoint(&ranges)?;
        self.allowed_port_ranges = ranges;
        Ok(())
    }

    /// True if `port` falls within one of the agent's declared ranges, or if
    /// the agent declares no ranges at all (meaning "no restriction" — the
    /// default pool is only consulted for *auto-assignment*, not validation
    /// of a caller-supplied port).
    pub fn is_port_allowed(&self, port: u16) -> bool {
        if self.allowed_port_ranges.is_empty() {
            return port >= 1;
        }
        self.allowed_port_ranges.iter().any(|r| r.contains(port))
    }

    /// The pool auto-assignment should sample from: the agent's own ranges,
    /// or the default pool when it declares none.
    pub fn assignment_pool(&self) -> Vec<PortRange> {
        if self.allowed_port_ranges.is_empty() {
            vec![DEFAULT_PORT_POOL]
        } else {
            self.allowed_port_ranges.clone()
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }
}
