//! bankshot-monitor: port observers and the remote-side supervisor.
//!
//! This crate provides:
//! - `/proc/net/tcp{,6}` parsing for the listening-socket snapshot
//! - The polling observer (system-wide or scoped to a single PID)
//! - A kernel-tracepoint observer (feature `ebpf`)
//! - The supervisor that turns observer events into forward/unforward RPCs,
//!   with grace-period collection, a reachability heartbeat, and one-shot
//!   reconciliation

pub mod event;
pub mod poll;
pub mod procnet;
pub mod reconcile;
pub mod source;
pub mod supervisor;

#[cfg(feature = "ebpf")]
pub mod ebpf;

pub use event::{EventKind, PortEvent, Protocol};
pub use source::{pid_source, system_source, PortEventSource};
pub use supervisor::{Supervisor, SupervisorConfig};
