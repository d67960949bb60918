//! Auto-discovery of pre-existing mux forwards.
//!
//! Runs once at startup, before the RPC socket accepts: scan `ps` for SSH
//! multiplex masters, read each master's loopback listeners with `lsof`,
//! and register them without issuing any SSH command. This lets the daemon
//! restart without losing track of forwards a prior instance created.
//!
//! The registered `remote_port` is assumed equal to the local port — the
//! true remote port is unknowable from the workstation side.

use std::process::Stdio;

use tokio::process::Command;

use bankshot_core::Result;

use crate::forward::ForwardManager;

/// A forward inferred from a running mux master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredForward {
    pub pid: u32,
    pub local_port: u16,
    pub connection: String,
    pub socket_path: String,
}

/// An SSH multiplex master found in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MuxProcess {
    pid: u32,
    socket_path: String,
    connection: String,
}

/// Discover active mux forwards and register them with the manager.
/// Returns how many were registered. Never fatal: discovery is best effort.
pub async fn register_discovered_forwards(manager: &ForwardManager) -> Result<usize> {
    let forwards = discover_active_forwards().await?;
    let mut registered = 0;

    for forward in &forwards {
        if forward.connection.is_empty() {
            tracing::debug!(
                local_port = forward.local_port,
                "skipping discovered forward without connection info"
            );
            continue;
        }
        match manager
            .register_existing(
                &forward.connection,
                forward.local_port,
                forward.local_port,
                None,
                forward.socket_path.clone().into(),
            )
            .await
        {
            Ok(_) => registered += 1,
            Err(e) => tracing::warn!(
                local_port = forward.local_port,
                connection = %forward.connection,
                error = %e,
                "failed to register discovered forward"
            ),
        }
    }

    tracing::info!(
        discovered = forwards.len(),
        registered,
        "auto-discovery complete"
    );
    Ok(registered)
}

/// Enumerate loopback listeners of every running mux master.
pub async fn discover_active_forwards() -> Result<Vec<DiscoveredForward>> {
    let mut forwards = Vec::new();

    for process in find_mux_processes().await? {
        match listening_ports_of(process.pid).await {
            Ok(ports) => {
                for port in ports {
                    forwards.push(DiscoveredForward {
                        pid: process.pid,
                        local_port: port,
                        connection: process.connection.clone(),
                        socket_path: process.socket_path.clone(),
                    });
                }
            }
            Err(e) => {
                // The master may have exited between the two scans.
                tracing::debug!(pid = process.pid, error = %e, "lsof scan failed");
            }
        }
    }

    Ok(forwards)
}

/// Scan the process table for `ssh: <socket> [mux]` masters.
async fn find_mux_processes() -> Result<Vec<MuxProcess>> {
    let output = Command::new("ps")
        .arg("aux")
        .stdin(Stdio::null())
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_ps_line).collect())
}

/// Loopback LISTEN ports of one process, via `lsof -p <pid> -n -P`.
async fn listening_ports_of(pid: u32) -> Result<Vec<u16>> {
    let output = Command::new("lsof")
        .args(["-p", &pid.to_string(), "-n", "-P"])
        .stdin(Stdio::null())
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_lsof_listen_line).collect())
}

/// Parse one `ps aux` row into a mux master, if it is one.
///
/// Masters advertise themselves as `ssh: /path/to/socket [mux]` in their
/// command line.
fn parse_ps_line(line: &str) -> Option<MuxProcess> {
    if !line.contains("ssh:") || !line.contains("[mux]") {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 11 {
        return None;
    }
    let pid: u32 = fields[1].parse().ok()?;

    let command = fields[10..].join(" ");
    let after_marker = command.split("ssh: ").nth(1)?;
    let socket_path = after_marker.split_whitespace().next()?.to_string();
    if socket_path.is_empty() {
        return None;
    }

    let connection = connection_from_socket_path(&socket_path);
    Some(MuxProcess {
        pid,
        socket_path,
        connection,
    })
}

/// Infer a connection identifier from a control socket basename.
///
/// Handles the common ControlPath conventions:
/// `ssh_mux_<host>_<port>_<user>` and `master-<user>@<host>:<port>`. When
/// neither matches, the basename itself is the best guess available.
fn connection_from_socket_path(socket_path: &str) -> String {
    let basename = socket_path.rsplit('/').next().unwrap_or(socket_path);

    if let Some(rest) = basename.strip_prefix("ssh_mux_") {
        if let Some(host) = rest.split('_').next() {
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }

    if let Some(rest) = basename.strip_prefix("master-") {
        // user@host:port — the host is what ssh -G resolves.
        let host_part = rest.split('@').nth(1).unwrap_or(rest);
        let host = host_part.split(':').next().unwrap_or(host_part);
        if !host.is_empty() {
            return host.to_string();
        }
    }

    basename.to_string()
}

/// Parse one `lsof -n -P` row into a loopback LISTEN port.
fn parse_lsof_listen_line(line: &str) -> Option<u16> {
    if !line.contains("LISTEN") {
        return None;
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let addr = fields[8].strip_prefix("127.0.0.1:")?;
    addr.parse().ok()
}
