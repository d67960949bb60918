//! Forwarding policy: which observed listeners get auto-forwarded.
//!
//! The filter is evaluated on the remote side before any RPC is sent:
//! a port is forwarded iff it is bound to a wildcard/loopback address, is
//! not explicitly ignored, and falls inside the configured ranges (or above
//! the privileged threshold when no ranges are configured).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_IGNORE_PROCESSES, PRIVILEGED_PORT_CEILING};

/// An inclusive range of ports eligible for auto-forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Whether `port` falls inside this range.
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Returns true for bind addresses that should be considered for
/// forwarding: wildcard and loopback, v4 and v6.
///
/// Anything else (a Tailscale address, a specific interface bind) is
/// rejected because forwarding it would create a conflicting listener on
/// the workstation.
pub fn is_local_addr(addr: &str) -> bool {
    matches!(addr, "0.0.0.0" | "127.0.0.1" | "::" | "::1")
}

/// The supervisor's auto-forward policy.
#[derive(Debug, Clone)]
pub struct PortPolicy {
    port_ranges: Vec<PortRange>,
    ignore_ports: HashSet<u16>,
    ignore_processes: Vec<String>,
}

impl PortPolicy {
    pub fn new(
        port_ranges: Vec<PortRange>,
        ignore_ports: impl IntoIterator<Item = u16>,
        ignore_processes: Vec<String>,
    ) -> Self {
        Self {
            port_ranges,
            ignore_ports: ignore_ports.into_iter().collect(),
            ignore_processes,
        }
    }

    /// Whether a `(port, bind_addr)` pair should be forwarded.
    ///
    /// With no ranges configured, everything at or above the privileged
    /// threshold qualifies. `ignore_ports` wins over ranges.
    pub fn should_forward(&self, port: u16, bind_addr: &str) -> bool {
        if !is_local_addr(bind_addr) {
            return false;
        }
        if self.ignore_ports.contains(&port) {
            return false;
        }
        if self.port_ranges.is_empty() {
            port >= PRIVILEGED_PORT_CEILING
        } else {
            self.port_ranges.iter().any(|r| r.contains(port))
        }
    }

    /// Advisory process-name filter: case-insensitive substring match
    /// against the configured ignore list. Only effective when the observer
    /// backend knows the owning process name.
    pub fn ignores_process(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let name = name.to_lowercase();
        self.ignore_processes
            .iter()
            .any(|ignored| name.contains(&ignored.to_lowercase()))
    }
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            port_ranges: Vec::new(),
            ignore_ports: HashSet::new(),
            ignore_processes: DEFAULT_IGNORE_PROCESSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
