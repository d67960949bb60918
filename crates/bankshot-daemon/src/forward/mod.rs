//! Forward registry and lifecycle.
//!
//! The registry maps `(connection, host, remote_port)` to an active `-L`
//! forward held open on that connection's ControlMaster. All operations are
//! safe to call concurrently; SSH subprocesses never run while the registry
//! lock is held.

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::SystemTime;

use tokio::sync::RwLock;

use bankshot_core::protocol::ReconcileSummary;
use bankshot_core::{Error, Result};

use crate::resolver;
use crate::ssh::{forward_spec, SshRunner};

/// Forward identity: at most one registry entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub connection: String,
    pub host: String,
    pub remote_port: u16,
}

impl ForwardKey {
    fn new(connection: &str, host: &str, remote_port: u16) -> Self {
        Self {
            connection: connection.to_string(),
            host: host.to_string(),
            remote_port,
        }
    }
}

impl std::fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.connection, self.host, self.remote_port)
    }
}

/// An active forward.
#[derive(Debug, Clone)]
pub struct Forward {
    pub remote_port: u16,
    pub local_port: u16,
    pub host: String,
    pub connection: String,
    /// Control socket path as resolved when this forward was (last)
    /// established.
    pub control_socket: PathBuf,
    pub created_at: SystemTime,
}

impl Forward {
    fn key(&self) -> ForwardKey {
        ForwardKey::new(&self.connection, &self.host, self.remote_port)
    }
}

/// Owns the registry and executes `ssh -O` operations against it.
pub struct ForwardManager {
    ssh: SshRunner,
    registry: RwLock<HashMap<ForwardKey, Forward>>,
}

impl ForwardManager {
    pub fn new(ssh_command: &str) -> Self {
        Self {
            ssh: SshRunner::new(ssh_command),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// The runner shared with the resolver.
    pub fn ssh(&self) -> &SshRunner {
        &self.ssh
    }

    /// Create a forward, or return the existing one (idempotent by
    /// identity).
    pub async fn add(
        &self,
        connection: &str,
        remote_port: u16,
        local_port: Option<u16>,
        host: Option<String>,
        socket_path: Option<PathBuf>,
    ) -> Result<Forward> {
        let host = host.unwrap_or_else(|| "localhost".to_string());
        let local_port = local_port.unwrap_or(remote_port);
        let key = ForwardKey::new(connection, &host, remote_port);

        {
            let registry = self.registry.read().await;
            if let Some(existing) = registry.get(&key) {
                tracing::info!(%key, local_port = existing.local_port, "port already forwarded");
                return Ok(existing.clone());
            }
        }

        let control_socket = match socket_path {
            Some(path) => path,
            None => resolver::resolve_control_socket(&self.ssh, connection).await?,
        };

        let spec = forward_spec(local_port, &host, remote_port);
        let output = self
            .ssh
            .run(&["-O", "forward", "-L", &spec, connection])
            .await?;
        if !output.success {
            if output.is_benign_forward_failure() {
                tracing::debug!(%key, "forward already exists on the master");
            } else {
                return Err(Error::SshFail {
                    output: output.combined,
                });
            }
        }

        let forward = Forward {
            remote_port,
            local_port,
            host,
            connection: connection.to_string(),
            control_socket,
            created_at: SystemTime::now(),
        };

        let mut registry = self.registry.write().await;
        let entry = registry.entry(key.clone()).or_insert_with(|| forward.clone());
        tracing::info!(%key, local_port, "forward established");
        Ok(entry.clone())
    }

    /// Remove a forward.
    ///
    /// The registry entry is deleted whether or not the cancel succeeds —
    /// the forward may already be gone with the connection. After every
    /// cancel, static config forwards are re-applied: `ssh -O cancel` drops
    /// all socket-typed remote forwards on the mux as a side effect,
    /// including the `-R` socket this whole system runs over.
    pub async fn remove(
        &self,
        connection: &str,
        remote_port: u16,
        host: Option<String>,
    ) -> Result<()> {
        let host = host.unwrap_or_else(|| "localhost".to_string());
        let key = ForwardKey::new(connection, &host, remote_port);

        let forward = {
            let registry = self.registry.read().await;
            registry
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))?
        };

        let spec = forward_spec(forward.local_port, &host, remote_port);
        let output = self
            .ssh
            .run(&["-O", "cancel", "-L", &spec, connection])
            .await;
        match output {
            Ok(out) if !out.success => {
                tracing::warn!(%key, output = %out.combined, "cancel reported failure, removing anyway");
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "cancel failed, removing anyway");
            }
            _ => {}
        }

        self.reapply_static_forwards(connection).await;

        let mut registry = self.registry.write().await;
        registry.remove(&key);
        tracing::info!(%key, "forward removed");
        Ok(())
    }

    /// Re-apply forwards declared in the static SSH config by running
    /// `ssh -O forward` with no `-L`. Never surfaces an error: the user's
    /// unforward already happened.
    async fn reapply_static_forwards(&self, connection: &str) {
        match self.ssh.run(&["-O", "forward", connection]).await {
            Ok(out) if !out.success => {
                tracing::warn!(
                    connection,
                    output = %out.combined,
                    "failed to re-apply static forwards after cancel"
                );
            }
            Err(e) => {
                tracing::warn!(connection, error = %e, "failed to re-apply static forwards after cancel");
            }
            _ => {
                tracing::debug!(connection, "static forwards re-applied");
            }
        }
    }

    /// Record a forward that already exists on a mux without issuing any
    /// SSH command. Auto-discovery only.
    pub async fn register_existing(
        &self,
        connection: &str,
        remote_port: u16,
        local_port: u16,
        host: Option<String>,
        socket_path: PathBuf,
    ) -> Result<Forward> {
        let host = host.unwrap_or_else(|| "localhost".to_string());
        let forward = Forward {
            remote_port,
            local_port,
            host,
            connection: connection.to_string(),
            control_socket: socket_path,
            created_at: SystemTime::now(),
        };
        let key = forward.key();

        let mut registry = self.registry.write().await;
        let entry = registry.entry(key.clone()).or_insert(forward);
        tracing::info!(%key, local_port, "registered existing forward");
        Ok(entry.clone())
    }

    /// Idempotent sweep: every entry whose local port is no longer
    /// listening is re-established when its connection is alive and removed
    /// when it isn't. Entries whose re-establish attempt fails stay put for
    /// the next cycle.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let snapshot: Vec<Forward> = {
            let registry = self.registry.read().await;
            registry.values().cloned().collect()
        };

        let mut summary = ReconcileSummary {
            checked: snapshot.len(),
            ..Default::default()
        };
        let mut to_remove: Vec<ForwardKey> = Vec::new();
        let mut to_refresh: Vec<(ForwardKey, PathBuf)> = Vec::new();

        for forward in snapshot {
            let key = forward.key();

            if local_port_listening(forward.local_port) {
                summary.kept += 1;
                continue;
            }

            let socket = match resolver::resolve_control_socket(&self.ssh, &forward.connection).await
            {
                Ok(socket) => socket,
                Err(_) => {
                    tracing::info!(%key, "connection dead, dropping forward");
                    to_remove.push(key);
                    summary.removed += 1;
                    continue;
                }
            };

            let spec = forward_spec(forward.local_port, &forward.host, forward.remote_port);
            match self
                .ssh
                .run(&["-O", "forward", "-L", &spec, &forward.connection])
                .await
            {
                Ok(out) if out.success || out.is_benign_forward_failure() => {
                    tracing::info!(%key, "forward re-established");
                    to_refresh.push((key, socket));
                    summary.restored += 1;
                }
                Ok(out) => {
                    tracing::warn!(%key, output = %out.combined, "re-establish failed, keeping entry");
                    summary.kept += 1;
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "re-establish failed, keeping entry");
                    summary.kept += 1;
                }
            }
        }

        let mut registry = self.registry.write().await;
        for key in to_remove {
            registry.remove(&key);
        }
        for (key, socket) in to_refresh {
            if let Some(entry) = registry.get_mut(&key) {
                entry.control_socket = socket;
                entry.created_at = SystemTime::now();
            }
        }

        summary
    }

    /// Remove every forward on `connection`, cancelling each via SSH.
    /// Returns how many were removed.
    pub async fn cleanup_for_connection(&self, connection: &str) -> usize {
        let forwards = self.list_for(connection).await;
        let mut removed = 0;
        for forward in forwards {
            match self
                .remove(connection, forward.remote_port, Some(forward.host))
                .await
            {
                Ok(()) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => tracing::warn!(connection, error = %e, "cleanup remove failed"),
            }
        }
        removed
    }

    /// All forwards, unordered.
    pub async fn list(&self) -> Vec<Forward> {
        let registry = self.registry.read().await;
        registry.values().cloned().collect()
    }

    /// Forwards on one connection.
    pub async fn list_for(&self, connection: &str) -> Vec<Forward> {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|f| f.connection == connection)
            .cloned()
            .collect()
    }

    /// Number of active forwards.
    pub async fn len(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.is_empty()
    }
}

/// Probe whether something is listening on `127.0.0.1:port`.
///
/// A bind attempt is used instead of a connect so the probe has no side
/// effect on whatever service owns the port, and works on hosts without
/// `/proc/net`. A bind denied for privilege reasons says nothing about
/// listeners, so it conservatively counts as listening.
fn local_port_listening(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => false,
        Err(e) => matches!(
            e.kind(),
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
        ),
    }
}
