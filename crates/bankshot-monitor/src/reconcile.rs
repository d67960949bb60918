//! One-shot reconciliation between the daemon's registry and the local
//! listening set.
//!
//! Runs at supervisor startup (first successful heartbeat) and after every
//! unreachable→reachable transition, which is how forwards survive
//! sleep/wake and SSH reconnects.

use std::collections::HashSet;

use bankshot_core::protocol::{
    Command, ForwardPayload, ListData, Request, UnforwardPayload,
};
use bankshot_core::{DaemonRpc, PortPolicy, Result};

use crate::procnet::{self, ListenerSocket};

/// Ports to act on, computed from one consistent snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_forward: Vec<u16>,
    pub to_unforward: Vec<u16>,
}

/// What actually happened when the plan was executed.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub forwarded: Vec<u16>,
    pub unforwarded: Vec<u16>,
    pub failures: usize,
}

/// Compute the action sets.
///
/// `to_forward` is every policy-eligible listening port the daemon doesn't
/// already track. `to_unforward` is every tracked port that is not listening
/// at all — deliberately diffed against the full listening set rather than
/// the eligible subset, so out-of-range forwards created manually or via
/// `wrap` are preserved.
pub fn plan(
    daemon_ports: &HashSet<u16>,
    listening: &[ListenerSocket],
    policy: &PortPolicy,
) -> ReconcilePlan {
    let all: HashSet<u16> = listening.iter().map(|s| s.port).collect();
    let eligible: HashSet<u16> = listening
        .iter()
        .filter(|s| policy.should_forward(s.port, &s.bind_addr))
        .map(|s| s.port)
        .collect();

    let mut to_forward: Vec<u16> = eligible.difference(daemon_ports).copied().collect();
    let mut to_unforward: Vec<u16> = daemon_ports.difference(&all).copied().collect();
    to_forward.sort_unstable();
    to_unforward.sort_unstable();

    ReconcilePlan {
        to_forward,
        to_unforward,
    }
}

/// Query the daemon, compute the plan against the current listening set,
/// and execute it. Individual port failures are logged and counted, never
/// propagated: a half-applied reconcile converges on the next pass.
pub async fn run(
    client: &dyn DaemonRpc,
    session_id: &str,
    policy: &PortPolicy,
) -> Result<ReconcileOutcome> {
    let response = client.call(Request::bare(Command::List)).await?;
    let list: ListData = response.typed_data()?;

    let daemon_ports: HashSet<u16> = list
        .forwards
        .iter()
        .filter(|f| f.connection == session_id)
        .map(|f| f.remote_port)
        .collect();

    let listening = procnet::listening_sockets();
    let plan = plan(&daemon_ports, &listening, policy);

    tracing::info!(
        to_forward = plan.to_forward.len(),
        to_unforward = plan.to_unforward.len(),
        tracked = daemon_ports.len(),
        "reconciliation plan"
    );

    execute(client, session_id, plan).await
}

/// Issue the planned RPCs.
pub async fn execute(
    client: &dyn DaemonRpc,
    session_id: &str,
    plan: ReconcilePlan,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    for port in plan.to_forward {
        let request = Request::new(
            Command::Forward,
            &ForwardPayload {
                remote_port: port,
                local_port: Some(port),
                host: Some("localhost".into()),
                connection: session_id.to_string(),
                socket_path: None,
            },
        )?;
        match client.call(request).await.and_then(|r| r.into_result()) {
            Ok(_) => {
                tracing::info!(port, "reconcile: forward established");
                outcome.forwarded.push(port);
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "reconcile: forward failed");
                outcome.failures += 1;
            }
        }
    }

    for port in plan.to_unforward {
        let request = Request::new(
            Command::Unforward,
            &UnforwardPayload {
                remote_port: port,
                host: Some("localhost".into()),
                connection: session_id.to_string(),
            },
        )?;
        match client.call(request).await.and_then(|r| r.into_result()) {
            Ok(_) => {
                tracing::info!(port, "reconcile: stale forward removed");
                outcome.unforwarded.push(port);
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "reconcile: unforward failed");
                outcome.failures += 1;
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Protocol;
    use bankshot_core::PortRange;

    fn listener(port: u16, addr: &str) -> ListenerSocket {
        ListenerSocket {
            port,
            protocol: Protocol::Tcp,
            bind_addr: addr.to_string(),
        }
    }

    #[test]
    fn forwards_eligible_untracked_ports() {
        let plan = plan(
            &HashSet::new(),
            &[listener(8080, "0.0.0.0"), listener(3000, "127.0.0.1")],
            &PortPolicy::default(),
        );
        assert_eq!(plan.to_forward, vec![3000, 8080]);
        assert!(plan.to_unforward.is_empty());
    }

    #[test]
    fn removes_only_dead_forwards() {
        // 9000 listens but is outside the configured range (a wrap-created
        // forward); it must survive. 9100 is gone entirely; it must go.
        let policy = PortPolicy::new(
            vec![PortRange {
                start: 3000,
                end: 4000,
            }],
            [],
            vec![],
        );
        let tracked: HashSet<u16> = [9000, 9100].into_iter().collect();
        let plan = plan(&tracked, &[listener(9000, "127.0.0.1")], &policy);
        assert!(plan.to_forward.is_empty());
        assert_eq!(plan.to_unforward, vec![9100]);
    }

    #[test]
    fn already_tracked_ports_untouched() {
        let tracked: HashSet<u16> = [8080].into_iter().collect();
        let plan = plan(
            &tracked,
            &[listener(8080, "0.0.0.0")],
            &PortPolicy::default(),
        );
        assert_eq!(plan, ReconcilePlan::default());
    }

    #[test]
    fn ineligible_binds_not_forwarded() {
        let plan = plan(
            &HashSet::new(),
            &[listener(8080, "100.64.0.5"), listener(443, "0.0.0.0")],
            &PortPolicy::default(),
        );
        assert!(plan.to_forward.is_empty());
    }
}
