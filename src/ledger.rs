//! Flow deduplication ledger.
//!
//! Both sets only ever grow: a recorded flow or registered endpoint stays
//! recorded for the life of the process.

use std::fmt;
use std::net::Ipv4Addr;

use dashmap::DashSet;

/// Directed (source, destination) pair. `(a, b)` and `(b, a)` are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl FlowKey {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

#[derive(Debug, Default)]
pub struct FlowLedger {
    flows: DashSet<FlowKey>,
    external: DashSet<Ipv4Addr>,
}

impl FlowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as recorded. Returns `true` only for the caller that
    /// inserted it, so exactly one observer of a new flow gets to emit its
    /// edge.
    pub fn record_flow(&self, key: FlowKey) -> bool {
        self.flows.insert(key)
    }

    pub fn contains_flow(&self, key: &FlowKey) -> bool {
        self.flows.contains(key)
    }

    /// Marks `ip` as registered as a non-container node. Same contract as
    /// [`FlowLedger::record_flow`].
    pub fn register_external(&self, ip: Ipv4Addr) -> bool {
        self.external.insert(ip)
    }

    pub fn is_external_registered(&self, ip: &Ipv4Addr) -> bool {
        self.external.contains(ip)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn external_count(&self) -> usize {
        self.external.len()
    }
}
