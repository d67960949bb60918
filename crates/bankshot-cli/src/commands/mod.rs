//! Subcommand implementations.

pub mod config;
pub mod daemon;
pub mod forward;
pub mod list;
pub mod monitor;
pub mod open;
pub mod reconcile;
pub mod status;
pub mod unforward;
pub mod watch;
pub mod wrap;

use bankshot_core::{Config, DaemonClient, Error, Result};

/// Shared command context: effective config and the RPC client.
pub struct Context {
    pub config: Config,
    pub quiet: bool,
}

impl Context {
    pub fn new(config: Config, quiet: bool) -> Self {
        Self { config, quiet }
    }

    /// RPC client for the configured daemon socket.
    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(self.config.socket_path())
    }

    /// Print to stdout unless `--quiet`.
    pub fn say(&self, message: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", message.as_ref());
        }
    }
}

/// The connection identifier to use when none was given: this hostname,
/// which is what the workstation's `ssh -G` lookup expects to resolve.
pub fn default_connection() -> Result<String> {
    let hostname = nix::unistd::gethostname().map_err(|e| Error::Internal {
        message: format!("failed to read hostname: {}", e),
    })?;
    Ok(hostname.to_string_lossy().into_owned())
}
