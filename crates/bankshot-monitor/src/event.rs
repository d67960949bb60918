//! Port event types emitted by observers.

use std::time::SystemTime;

/// Transport protocol a listener was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Tcp6,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp6 => "tcp6",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Opened,
    Closed,
}

/// A single port state transition.
///
/// Per port, events are totally ordered by the emitting observer; across
/// ports there is no ordering guarantee.
#[derive(Debug, Clone)]
pub struct PortEvent {
    pub kind: EventKind,
    pub port: u16,
    pub protocol: Protocol,
    /// Textual bind address; may be empty when the backend does not know it.
    pub bind_addr: String,
    /// Owning process, 0 when unknown.
    pub pid: u32,
    /// Name of the owning process, empty when unknown.
    pub process_name: String,
    pub timestamp: SystemTime,
}

impl PortEvent {
    pub fn opened(port: u16, protocol: Protocol, bind_addr: impl Into<String>, pid: u32) -> Self {
        Self {
            kind: EventKind::Opened,
            port,
            protocol,
            bind_addr: bind_addr.into(),
            pid,
            process_name: String::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn closed(port: u16, protocol: Protocol, bind_addr: impl Into<String>, pid: u32) -> Self {
        Self {
            kind: EventKind::Closed,
            port,
            protocol,
            bind_addr: bind_addr.into(),
            pid,
            process_name: String::new(),
            timestamp: SystemTime::now(),
        }
    }
}
