//! Child process management for `wrap`.
//!
//! The wrapped command inherits stdio so it behaves like a normal shell
//! invocation; signals are delivered by PID so the wait future keeps
//! exclusive use of the child handle.

use std::os::unix::process::ExitStatusExt;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use bankshot_core::{Error, Result};

/// A spawned child command.
pub struct WrappedChild {
    child: Child,
    pid: u32,
}

impl WrappedChild {
    /// Spawn `argv` with the given extra environment on top of the
    /// inherited one.
    pub fn spawn(argv: &[String], extra_env: &[(&str, String)]) -> Result<WrappedChild> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Internal {
            message: "wrap requires a command".into(),
        })?;

        let mut command = Command::new(program);
        command.args(args);
        for (name, value) in extra_env {
            command.env(name, value);
        }

        let child = command.spawn().map_err(|e| Error::Internal {
            message: format!("failed to start {}: {}", program, e),
        })?;
        let pid = child.id().ok_or_else(|| Error::Internal {
            message: "child exited before it could be observed".into(),
        })?;

        Ok(WrappedChild { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit. Returns the exit code, or `128 + signal` when the
    /// child was killed by one, matching shell conventions.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        if let Some(code) = status.code() {
            return Ok(code);
        }
        Ok(status.signal().map(|sig| 128 + sig).unwrap_or(1))
    }

}

/// Signal a PID directly (used from select arms where the child handle's
/// wait future holds the exclusive borrow).
pub fn deliver_to(pid: u32, signal: Signal) {
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, %signal, error = %e, "failed to signal child");
    }
}
