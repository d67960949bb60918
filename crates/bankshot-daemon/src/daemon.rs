//! Daemon state and lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use bankshot_core::protocol::{
    Command, ConnectionStatus, ForwardEntry, ForwardPayload, ListData, OpenPayload, Request,
    Response, StatusData, UnforwardPayload,
};
use bankshot_core::{Config, Result};

use crate::discover;
use crate::forward::{Forward, ForwardManager};
use crate::opener::UrlOpener;
use crate::server::{self, RpcListener};
use crate::socket;

/// The workstation daemon: forward registry, URL opener, RPC dispatch.
pub struct Daemon {
    config: Config,
    manager: ForwardManager,
    opener: UrlOpener,
    started_at: Instant,
}

impl Daemon {
    pub fn new(config: Config) -> Arc<Self> {
        let manager = ForwardManager::new(&config.ssh_command);
        Arc::new(Self {
            config,
            manager,
            opener: UrlOpener::new(),
            started_at: Instant::now(),
        })
    }

    pub fn manager(&self) -> &ForwardManager {
        &self.manager
    }

    /// Bind, auto-discover, and serve until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        // Discover before accepting so the first LIST a supervisor sends
        // already sees pre-existing forwards.
        if let Err(e) = discover::register_discovered_forwards(&self.manager).await {
            tracing::warn!(error = %e, "auto-discovery failed");
        }

        match self.config.network.as_str() {
            "tcp" => {
                let listener = tokio::net::TcpListener::bind(&self.config.address).await?;
                tracing::info!(address = %self.config.address, "daemon listening (tcp)");
                server::serve(RpcListener::Tcp(listener), self.clone(), cancel).await
            }
            _ => {
                let path = self.config.socket_path();
                let (_guard, listener) = socket::bind_daemon_socket(&path).await?;
                server::serve(RpcListener::Unix(listener), self.clone(), cancel).await
                // _guard drops here and unlinks the socket file.
            }
        }
    }

    /// Route one request to its handler, mapping errors onto the wire.
    pub async fn dispatch(&self, request: Request) -> Response {
        let id = request.id.clone();
        let result = match request.dispatch() {
            Ok(Command::Open) => self.handle_open(&request).await,
            Ok(Command::Forward) => self.handle_forward(&request).await,
            Ok(Command::Unforward) => self.handle_unforward(&request).await,
            Ok(Command::Status) => self.handle_status(&request).await,
            Ok(Command::List) => self.handle_list(&request).await,
            Ok(Command::Reconcile) => self.handle_reconcile(&request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "request failed");
                Response::failure(&id, &e)
            }
        }
    }

    async fn handle_open(&self, request: &Request) -> Result<Response> {
        let payload: OpenPayload = request.typed_payload()?;
        self.opener.open(&payload.url).await?;
        Ok(Response::success(
            &request.id,
            &serde_json::json!({ "message": format!("Opened URL: {}", payload.url) }),
        ))
    }

    async fn handle_forward(&self, request: &Request) -> Result<Response> {
        let payload: ForwardPayload = request.typed_payload()?;
        let forward = self
            .manager
            .add(
                &payload.connection,
                payload.remote_port,
                payload.local_port,
                payload.host,
                payload.socket_path.map(Into::into),
            )
            .await?;

        Ok(Response::success(
            &request.id,
            &serde_json::json!({
                "message": format!(
                    "Forwarded {}:{} to localhost:{}",
                    forward.host, forward.remote_port, forward.local_port
                ),
                "socket_path": forward.control_socket.display().to_string(),
            }),
        ))
    }

    async fn handle_unforward(&self, request: &Request) -> Result<Response> {
        let payload: UnforwardPayload = request.typed_payload()?;
        let host = payload.host.clone().unwrap_or_else(|| "localhost".into());
        self.manager
            .remove(&payload.connection, payload.remote_port, payload.host)
            .await?;

        Ok(Response::success(
            &request.id,
            &serde_json::json!({
                "message": format!("Removed forward for {}:{}", host, payload.remote_port),
            }),
        ))
    }

    async fn handle_status(&self, request: &Request) -> Result<Response> {
        let forwards = self.manager.list().await;

        let mut by_connection: std::collections::HashMap<String, (usize, SystemTime)> =
            std::collections::HashMap::new();
        for forward in &forwards {
            let entry = by_connection
                .entry(forward.connection.clone())
                .or_insert((0, forward.created_at));
            entry.0 += 1;
            if forward.created_at > entry.1 {
                entry.1 = forward.created_at;
            }
        }

        let mut connections: Vec<ConnectionStatus> = by_connection
            .into_iter()
            .map(|(connection, (forward_count, last))| ConnectionStatus {
                connection,
                forward_count,
                last_activity: rfc3339(last),
            })
            .collect();
        connections.sort_by(|a, b| a.connection.cmp(&b.connection));

        let status = StatusData {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: format_uptime(self.started_at.elapsed()),
            active_forwards: forwards.len(),
            connections,
        };
        Ok(Response::success(&request.id, &status))
    }

    async fn handle_list(&self, request: &Request) -> Result<Response> {
        let mut forwards = self.manager.list().await;
        forwards.sort_by(|a, b| {
            (&a.connection, a.remote_port).cmp(&(&b.connection, b.remote_port))
        });

        let entries: Vec<ForwardEntry> = forwards.iter().map(entry_of).collect();
        Ok(Response::success(&request.id, &ListData { forwards: entries }))
    }

    async fn handle_reconcile(&self, request: &Request) -> Result<Response> {
        let summary = self.manager.reconcile().await;
        tracing::info!(
            checked = summary.checked,
            restored = summary.restored,
            removed = summary.removed,
            kept = summary.kept,
            "registry reconciled"
        );
        Ok(Response::success(&request.id, &summary))
    }
}

fn entry_of(forward: &Forward) -> ForwardEntry {
    ForwardEntry {
        remote_port: forward.remote_port,
        local_port: forward.local_port,
        host: forward.host.clone(),
        connection: forward.connection.clone(),
        created_at: rfc3339(forward.created_at),
    }
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Humanized uptime: `"42s"`, `"5m3s"`, `"2h0m11s"`.
fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(303)), "5m3s");
        assert_eq!(format_uptime(Duration::from_secs(7211)), "2h0m11s");
    }

    #[test]
    fn rfc3339_has_utc_suffix() {
        let formatted = rfc3339(SystemTime::UNIX_EPOCH);
        assert_eq!(formatted, "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn status_groups_by_connection() {
        let config = Config {
            ssh_command: "false".into(),
            ..Config::default()
        };
        let daemon = Daemon::new(config);
        daemon
            .manager()
            .register_existing("alpha", 3000, 3000, None, "/tmp/a".into())
            .await
            .unwrap();
        daemon
            .manager()
            .register_existing("alpha", 3001, 3001, None, "/tmp/a".into())
            .await
            .unwrap();
        daemon
            .manager()
            .register_existing("beta", 4000, 4000, None, "/tmp/b".into())
            .await
            .unwrap();

        let response = daemon.dispatch(Request::bare(Command::Status)).await;
        assert!(response.ok);
        let status: StatusData = response.typed_data().unwrap();
        assert_eq!(status.active_forwards, 3);
        assert_eq!(status.connections.len(), 2);
        assert_eq!(status.connections[0].connection, "alpha");
        assert_eq!(status.connections[0].forward_count, 2);
        assert_eq!(status.connections[1].forward_count, 1);
    }

    #[tokio::test]
    async fn list_is_sorted_and_typed() {
        let config = Config {
            ssh_command: "false".into(),
            ..Config::default()
        };
        let daemon = Daemon::new(config);
        daemon
            .manager()
            .register_existing("zeta", 9000, 9000, None, "/tmp/z".into())
            .await
            .unwrap();
        daemon
            .manager()
            .register_existing("alpha", 8080, 18080, Some("db.internal".into()), "/tmp/a".into())
            .await
            .unwrap();

        let response = daemon.dispatch(Request::bare(Command::List)).await;
        let list: ListData = response.typed_data().unwrap();
        assert_eq!(list.forwards.len(), 2);
        assert_eq!(list.forwards[0].connection, "alpha");
        assert_eq!(list.forwards[0].host, "db.internal");
        assert_eq!(list.forwards[0].local_port, 18080);
        assert_eq!(list.forwards[1].connection, "zeta");
    }
}
