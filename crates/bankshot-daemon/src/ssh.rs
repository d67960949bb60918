//! SSH subprocess execution.
//!
//! Every interaction with OpenSSH goes through [`SshRunner`]: spawn the
//! configured binary, capture combined stdout/stderr, and enforce the
//! subprocess timeout. Callers decide what a non-zero exit means — several
//! `-O` operations report success on stderr with exit 255.

use std::process::Stdio;

use tokio::process::Command;

use bankshot_core::constants::SSH_COMMAND_TIMEOUT;
use bankshot_core::{Error, Result};

/// Outcome of one ssh invocation.
#[derive(Debug, Clone)]
pub struct SshOutput {
    /// Whether the process exited zero.
    pub success: bool,
    /// Combined stdout + stderr, trimmed.
    pub combined: String,
}

impl SshOutput {
    /// True when the output marks an already-existing forward, which `add`
    /// treats as success.
    pub fn is_benign_forward_failure(&self) -> bool {
        self.combined.contains("already forwarded")
            || self.combined.contains("Address already in use")
    }
}

/// Runs the configured ssh binary with a bounded lifetime.
#[derive(Debug, Clone)]
pub struct SshRunner {
    ssh_command: String,
}

impl SshRunner {
    pub fn new(ssh_command: impl Into<String>) -> Self {
        Self {
            ssh_command: ssh_command.into(),
        }
    }

    /// The binary this runner invokes.
    pub fn command(&self) -> &str {
        &self.ssh_command
    }

    /// Run `ssh <args>` and capture combined output. The subprocess is
    /// killed and [`Error::Timeout`] returned if it outlives the timeout.
    pub async fn run(&self, args: &[&str]) -> Result<SshOutput> {
        tracing::debug!(command = %self.ssh_command, ?args, "executing ssh");

        let mut command = Command::new(&self.ssh_command);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(SSH_COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Internal {
                message: format!("failed to spawn {}: {}", self.ssh_command, e),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        Ok(SshOutput {
            success: output.status.success(),
            combined,
        })
    }
}

/// Format a `-L` forward argument: `local:host:remote`.
pub fn forward_spec(local_port: u16, host: &str, remote_port: u16) -> String {
    format!("{}:{}:{}", local_port, host, remote_port)
}
