//! Control-socket resolution.
//!
//! Maps a connection identifier to the live ControlMaster socket path:
//! probe liveness with `ssh -O check`, read the resolved `controlpath` from
//! `ssh -G` (token expansion done by ssh itself), and verify the path is an
//! existing AF_UNIX socket.
//!
//! Resolution is deliberately never cached: the path is stable under
//! ControlPersist but rewritten when SSH reconnects, and a stale path is
//! exactly the failure reconciliation exists to repair.

use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use bankshot_core::{Error, Result};

use crate::ssh::SshRunner;

/// Resolve the control socket for `connection`, or fail with `E_NO_SSH`.
pub async fn resolve_control_socket(ssh: &SshRunner, connection: &str) -> Result<PathBuf> {
    if !connection_alive(ssh, connection).await? {
        return Err(Error::NoSsh {
            connection: connection.to_string(),
        });
    }

    let output = ssh.run(&["-G", connection]).await?;
    if !output.success {
        return Err(Error::NoSsh {
            connection: connection.to_string(),
        });
    }

    let path = parse_controlpath(&output.combined).ok_or_else(|| Error::NoSsh {
        connection: connection.to_string(),
    })?;

    let metadata = std::fs::metadata(&path).map_err(|_| Error::NoSsh {
        connection: connection.to_string(),
    })?;
    if !metadata.file_type().is_socket() {
        return Err(Error::NoSsh {
            connection: connection.to_string(),
        });
    }

    Ok(PathBuf::from(path))
}

/// Probe `ssh -O check`.
///
/// OpenSSH prints "Master running (pid=…)" on stderr; current builds exit 0
/// but older ones exit 255 with the same message, so both count as alive.
pub async fn connection_alive(ssh: &SshRunner, connection: &str) -> Result<bool> {
    let output = ssh.run(&["-O", "check", connection]).await?;
    Ok(output.success || output.combined.contains("Master running"))
}

/// Pull the `controlpath` value out of `ssh -G` output.
fn parse_controlpath(output: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        let Some(option) = tokens.next() else {
            continue;
        };
        if option.eq_ignore_ascii_case("controlpath") {
            let path = tokens.next()?;
            // "none" means multiplexing is not configured for this host.
            if path.eq_ignore_ascii_case("none") {
                return None;
            }
            return Some(path.to_string());
        }
    }
    None
}
