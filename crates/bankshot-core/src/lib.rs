//! bankshot-core: Shared library for the bankshot daemon, supervisor, and CLI.
//!
//! This crate provides:
//! - Wire protocol types and the newline-delimited JSON codec
//! - The RPC client used by the CLI and the remote supervisor
//! - Error taxonomy shared across processes and the wire
//! - Configuration loading
//! - Port forwarding policy (ranges, ignores, bind-address filter)
//! - Logging setup

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod policy;
pub mod protocol;

pub use client::{DaemonClient, DaemonRpc};
pub use config::Config;
pub use error::{Error, ErrorCode, Result};
pub use logging::{init_logging, LogFormat};
pub use policy::{PortPolicy, PortRange};
