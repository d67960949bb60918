//! Daemon socket binding.
//!
//! Refuses to start over a responsive daemon: the existing socket gets a
//! `status` probe, and only a dead one is unlinked. The socket file is
//! created under umask 0077 with mode 0600, its directory 0700 when newly
//! created, and removed again by an RAII guard.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;

use bankshot_core::constants::STALE_SOCKET_PROBE_TIMEOUT;
use bankshot_core::protocol::{Command, Request};
use bankshot_core::{DaemonClient, DaemonRpc, Error, Result};

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bind the daemon's unix socket with single-instance enforcement.
pub async fn bind_daemon_socket(path: &Path) -> Result<(SocketGuard, UnixListener)> {
    if path.exists() {
        if another_daemon_running(path).await {
            return Err(Error::Internal {
                message: format!(
                    "another bankshot daemon is already running at {}",
                    path.display()
                ),
            });
        }
        tracing::debug!(path = %path.display(), "removing stale socket");
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        } else if let Ok(metadata) = std::fs::metadata(parent) {
            if metadata.permissions().mode() & 0o077 != 0 {
                tracing::warn!(
                    path = %parent.display(),
                    mode = format!("{:o}", metadata.permissions().mode() & 0o777),
                    "socket directory has weak permissions"
                );
            }
        }
    }

    // Keep the window between bind and chmod closed as well.
    let old_umask = unsafe { libc::umask(0o077) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old_umask) };
    let listener = listener?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    tracing::info!(path = %path.display(), "daemon socket bound");
    Ok((
        SocketGuard {
            path: path.to_path_buf(),
        },
        listener,
    ))
}

/// Probe an existing socket file with a `status` request.
///
/// Any parseable response means a live daemon owns the path; connection
/// refusal or garbage means the socket is stale.
async fn another_daemon_running(path: &Path) -> bool {
    let client = DaemonClient::new(path).with_timeout(STALE_SOCKET_PROBE_TIMEOUT);
    client.call(Request::bare(Command::Status)).await.is_ok()
}
