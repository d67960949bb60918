//! Remote session supervisor.
//!
//! Consumes observer events and keeps the workstation daemon's registry in
//! sync: forward on OPENED (after policy), unforward on CLOSED after a grace
//! period, drop stale CLOSED events from hot-reload races, and reconcile
//! whenever the daemon socket comes back after being unreachable.
//!
//! The per-port state machine lives in [`SessionState`], which is pure and
//! synchronous; the async shell around it never holds the state lock across
//! an RPC.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bankshot_core::constants::{GRACE_SWEEP_INTERVAL, HEARTBEAT_INTERVAL};
use bankshot_core::protocol::{Command, ForwardPayload, Request, UnforwardPayload};
use bankshot_core::{DaemonRpc, PortPolicy, Result};

use crate::event::{EventKind, PortEvent};
use crate::procnet;
use crate::reconcile;
use crate::source::PortEventSource;

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Used as the `connection` field in every RPC; the workstation resolves
    /// `ssh -G <session_id>` to find the same ControlPath the user's shell
    /// SSH uses. Defaults to the remote hostname.
    pub session_id: String,
    pub policy: PortPolicy,
    pub grace_period: Duration,
}

/// What an OPENED event requires, decided under the state lock.
#[derive(Debug, PartialEq, Eq)]
enum OpenedDisposition {
    /// Fresh port: run the policy filter, then forward.
    New,
    /// Was pending removal: cancel that and re-issue the forward.
    Reissue,
    /// Already forwarded and not pending: nothing to do.
    AlreadyForwarded,
}

/// Pure per-port state: `forwarded` tracks every port this supervisor has
/// asked the daemon to forward; `pending_removal` holds close timestamps
/// awaiting grace expiry. A pending port stays in `forwarded` until it is
/// actually collected.
#[derive(Debug, Default)]
struct SessionState {
    forwarded: HashSet<u16>,
    pending_removal: HashMap<u16, Instant>,
}

impl SessionState {
    fn note_opened(&mut self, port: u16) -> OpenedDisposition {
        if self.pending_removal.remove(&port).is_some() {
            OpenedDisposition::Reissue
        } else if self.forwarded.contains(&port) {
            OpenedDisposition::AlreadyForwarded
        } else {
            OpenedDisposition::New
        }
    }

    /// Optimistically claim a port before the RPC goes out, so a concurrent
    /// OPENED for the same port doesn't double-send.
    fn begin_forward(&mut self, port: u16) {
        self.forwarded.insert(port);
    }

    /// Roll back a failed forward so the next OPENED or reconcile retries.
    fn forward_failed(&mut self, port: u16) {
        self.forwarded.remove(&port);
        self.pending_removal.remove(&port);
    }

    /// Mark a verified close. Returns false for ports we never forwarded.
    fn note_closed(&mut self, port: u16, now: Instant) -> bool {
        if !self.forwarded.contains(&port) {
            return false;
        }
        self.pending_removal.entry(port).or_insert(now);
        true
    }

    /// Collect ports whose grace has expired. Ports that turn out to be
    /// listening again are rescued back to plain forwarded state instead.
    fn collect_expired(
        &mut self,
        now: Instant,
        grace: Duration,
        still_listening: &HashSet<u16>,
    ) -> Vec<u16> {
        let expired: Vec<u16> = self
            .pending_removal
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= grace)
            .map(|(port, _)| *port)
            .collect();

        let mut to_remove = Vec::new();
        for port in expired {
            self.pending_removal.remove(&port);
            if still_listening.contains(&port) {
                // Came back without an OPENED reaching us; keep the forward.
                continue;
            }
            self.forwarded.remove(&port);
            to_remove.push(port);
        }
        to_remove.sort_unstable();
        to_remove
    }

    /// Absorb a reconcile outcome so our view matches the daemon's.
    fn absorb_reconcile(&mut self, forwarded: &[u16], unforwarded: &[u16]) {
        for port in forwarded {
            self.forwarded.insert(*port);
        }
        for port in unforwarded {
            self.forwarded.remove(port);
            self.pending_removal.remove(port);
        }
    }

    /// Empty the state, returning every port we were responsible for.
    fn drain(&mut self) -> Vec<u16> {
        self.pending_removal.clear();
        let mut ports: Vec<u16> = self.forwarded.drain().collect();
        ports.sort_unstable();
        ports
    }

    fn tracks(&self, port: u16) -> bool {
        self.forwarded.contains(&port)
    }
}

/// The remote-side supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    client: Arc<dyn DaemonRpc>,
    state: Mutex<SessionState>,
    /// Snapshot of currently listening ports; a seam so the hot-reload and
    /// grace checks are testable without `/proc`.
    listening: Box<dyn Fn() -> HashSet<u16> + Send + Sync>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, client: Arc<dyn DaemonRpc>) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            state: Mutex::new(SessionState::default()),
            listening: Box::new(procnet::listening_port_set),
        })
    }

    #[cfg(test)]
    fn with_listening(
        config: SupervisorConfig,
        client: Arc<dyn DaemonRpc>,
        listening: impl Fn() -> HashSet<u16> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            state: Mutex::new(SessionState::default()),
            listening: Box::new(listening),
        })
    }

    /// Run until cancelled: event handling, grace collection, and the
    /// reachability heartbeat each get their own task. On the way out every
    /// forward this supervisor created is removed, best effort.
    pub async fn run(
        self: Arc<Self>,
        source: Box<dyn PortEventSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            session = %self.config.session_id,
            grace_secs = self.config.grace_period.as_secs(),
            "supervisor starting"
        );

        let events = source.start(cancel.child_token()).await?;

        let event_task = tokio::spawn(self.clone().event_loop(events, cancel.clone()));
        let grace_task = tokio::spawn(self.clone().grace_loop(cancel.clone()));
        let heartbeat_task = tokio::spawn(self.clone().heartbeat_loop(cancel.clone()));

        cancel.cancelled().await;
        let _ = tokio::join!(event_task, grace_task, heartbeat_task);

        self.cleanup().await;
        tracing::info!(session = %self.config.session_id, "supervisor stopped");
        Ok(())
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PortEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::warn!("observer stream closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: PortEvent) {
        match event.kind {
            EventKind::Opened => self.handle_opened(event).await,
            EventKind::Closed => self.handle_closed(event).await,
        }
    }

    async fn handle_opened(&self, event: PortEvent) {
        if self.config.policy.ignores_process(&event.process_name) {
            tracing::debug!(
                port = event.port,
                process = %event.process_name,
                "ignoring event from ignored process"
            );
            return;
        }

        let disposition = {
            let mut state = self.state.lock();
            let disposition = state.note_opened(event.port);
            if disposition == OpenedDisposition::New {
                if !self
                    .config
                    .policy
                    .should_forward(event.port, &event.bind_addr)
                {
                    tracing::debug!(
                        port = event.port,
                        bind_addr = %event.bind_addr,
                        "port rejected by policy"
                    );
                    return;
                }
                state.begin_forward(event.port);
            }
            disposition
        };

        if disposition == OpenedDisposition::AlreadyForwarded {
            return;
        }

        if disposition == OpenedDisposition::Reissue {
            tracing::info!(port = event.port, "port reopened within grace, re-issuing forward");
        } else {
            tracing::info!(port = event.port, bind_addr = %event.bind_addr, "requesting forward");
        }

        if let Err(e) = self.send_forward(event.port).await {
            tracing::error!(port = event.port, error = %e, "forward request failed");
            let mut state = self.state.lock();
            state.forward_failed(event.port);
        }
    }

    async fn handle_closed(&self, event: PortEvent) {
        {
            let state = self.state.lock();
            if !state.tracks(event.port) {
                return;
            }
        }

        // Hot reloads produce OPENED(new pid) then CLOSED(old pid) for the
        // same port; only act when the port is actually gone.
        if (self.listening)().contains(&event.port) {
            tracing::debug!(port = event.port, "port still listening, dropping close event");
            return;
        }

        let mut state = self.state.lock();
        if state.note_closed(event.port, Instant::now()) {
            tracing::info!(
                port = event.port,
                grace_secs = self.config.grace_period.as_secs(),
                "port closed, scheduling forward removal"
            );
        }
    }

    async fn grace_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(GRACE_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.sweep_expired().await,
            }
        }
    }

    async fn sweep_expired(&self) {
        let expired = {
            let still_listening = (self.listening)();
            let mut state = self.state.lock();
            state.collect_expired(Instant::now(), self.config.grace_period, &still_listening)
        };

        for port in expired {
            tracing::info!(port, "grace expired, removing forward");
            if let Err(e) = self.send_unforward(port).await {
                tracing::error!(port, error = %e, "unforward request failed");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reachable = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    let now_reachable = self
                        .client
                        .call(Request::bare(Command::Status))
                        .await
                        .map(|r| r.ok)
                        .unwrap_or(false);

                    if now_reachable && !reachable {
                        tracing::info!("daemon socket reachable, reconciling");
                        self.reconcile().await;
                    } else if !now_reachable && reachable {
                        tracing::warn!("daemon socket became unreachable");
                    }
                    reachable = now_reachable;
                }
            }
        }
    }

    /// One-shot reconcile, absorbing the outcome into local state.
    pub async fn reconcile(&self) {
        match reconcile::run(
            self.client.as_ref(),
            &self.config.session_id,
            &self.config.policy,
        )
        .await
        {
            Ok(outcome) => {
                let mut state = self.state.lock();
                state.absorb_reconcile(&outcome.forwarded, &outcome.unforwarded);
                tracing::info!(
                    forwarded = outcome.forwarded.len(),
                    unforwarded = outcome.unforwarded.len(),
                    failures = outcome.failures,
                    "reconciliation complete"
                );
            }
            Err(e) => tracing::error!(error = %e, "reconciliation failed"),
        }
    }

    async fn cleanup(&self) {
        let ports = {
            let mut state = self.state.lock();
            state.drain()
        };
        for port in ports {
            if let Err(e) = self.send_unforward(port).await {
                tracing::warn!(port, error = %e, "cleanup unforward failed");
            }
        }
    }

    async fn send_forward(&self, port: u16) -> Result<()> {
        let request = Request::new(
            Command::Forward,
            &ForwardPayload {
                remote_port: port,
                local_port: Some(port),
                host: Some("localhost".into()),
                connection: self.config.session_id.clone(),
                socket_path: None,
            },
        )?;
        self.client.call(request).await?.into_result().map(|_| ())
    }

    async fn send_unforward(&self, port: u16) -> Result<()> {
        let request = Request::new(
            Command::Unforward,
            &UnforwardPayload {
                remote_port: port,
                host: Some("localhost".into()),
                connection: self.config.session_id.clone(),
            },
        )?;
        self.client.call(request).await?.into_result().map(|_| ())
    }

    /// Ports currently believed forwarded (test and status support).
    pub fn forwarded_ports(&self) -> Vec<u16> {
        let state = self.state.lock();
        let mut ports: Vec<u16> = state.forwarded.iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Protocol;
    use async_trait::async_trait;
    use bankshot_core::protocol::{ListData, Response};
    use bankshot_core::Error;

    /// Records every request; answers `list` with an empty registry and
    /// everything else with success, unless `fail_forwards` is set.
    struct FakeDaemon {
        calls: Mutex<Vec<Request>>,
        fail_forwards: bool,
    }

    impl FakeDaemon {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_forwards: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_forwards: true,
            })
        }

        fn calls_of(&self, command: &str) -> Vec<Request> {
            self.calls
                .lock()
                .iter()
                .filter(|r| r.command == command)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl DaemonRpc for FakeDaemon {
        async fn call(&self, request: Request) -> Result<Response> {
            self.calls.lock().push(request.clone());
            if request.command == "forward" && self.fail_forwards {
                return Ok(Response::failure(
                    &request.id,
                    &Error::NoSsh {
                        connection: "testhost".into(),
                    },
                ));
            }
            if request.command == "list" {
                return Ok(Response::success(&request.id, &ListData { forwards: vec![] }));
            }
            Ok(Response::success_empty(&request.id))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            session_id: "testhost".into(),
            policy: PortPolicy::default(),
            grace_period: Duration::from_secs(30),
        }
    }

    fn opened(port: u16) -> PortEvent {
        PortEvent::opened(port, Protocol::Tcp, "0.0.0.0", 100)
    }

    fn closed(port: u16) -> PortEvent {
        PortEvent::closed(port, Protocol::Tcp, "0.0.0.0", 100)
    }

    #[tokio::test]
    async fn opened_issues_one_forward() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(opened(8080)).await;
        sup.handle_event(opened(8080)).await;
        sup.handle_event(opened(8080)).await;

        assert_eq!(daemon.calls_of("forward").len(), 1);
        assert_eq!(sup.forwarded_ports(), vec![8080]);
    }

    #[tokio::test]
    async fn policy_rejection_sends_nothing() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(opened(443)).await; // privileged
        sup.handle_event(PortEvent::opened(8080, Protocol::Tcp, "100.64.0.5", 1))
            .await; // VPN bind

        assert!(daemon.calls_of("forward").is_empty());
        assert!(sup.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn failed_forward_is_retried_on_next_open() {
        let daemon = FakeDaemon::failing();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(opened(8080)).await;
        assert!(sup.forwarded_ports().is_empty());

        sup.handle_event(opened(8080)).await;
        assert_eq!(daemon.calls_of("forward").len(), 2);
    }

    #[tokio::test]
    async fn close_of_still_listening_port_is_dropped() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), || {
            [3000u16].into_iter().collect()
        });

        // Hot reload: OPENED(pid A), OPENED(pid B), CLOSED(pid A) while the
        // port is still listening.
        sup.handle_event(opened(3000)).await;
        sup.handle_event(opened(3000)).await;
        sup.handle_event(closed(3000)).await;

        assert_eq!(sup.forwarded_ports(), vec![3000]);
        sup.sweep_expired().await;
        assert!(daemon.calls_of("unforward").is_empty());
    }

    #[tokio::test]
    async fn grace_period_gates_unforward() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(
            SupervisorConfig {
                grace_period: Duration::from_millis(50),
                ..config()
            },
            daemon.clone(),
            HashSet::new,
        );

        sup.handle_event(opened(5000)).await;
        sup.handle_event(closed(5000)).await;

        // Within the grace window: nothing happens.
        sup.sweep_expired().await;
        assert!(daemon.calls_of("unforward").is_empty());
        assert_eq!(sup.forwarded_ports(), vec![5000]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        sup.sweep_expired().await;
        assert_eq!(daemon.calls_of("unforward").len(), 1);
        assert!(sup.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn reopen_within_grace_cancels_removal_and_reissues() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(
            SupervisorConfig {
                grace_period: Duration::from_millis(50),
                ..config()
            },
            daemon.clone(),
            HashSet::new,
        );

        sup.handle_event(opened(5000)).await;
        sup.handle_event(closed(5000)).await;
        sup.handle_event(opened(5000)).await;

        // Re-issue happened (daemon treats it as idempotent).
        assert_eq!(daemon.calls_of("forward").len(), 2);

        // And the pending removal is gone: grace expiry removes nothing.
        tokio::time::sleep(Duration::from_millis(60)).await;
        sup.sweep_expired().await;
        assert!(daemon.calls_of("unforward").is_empty());
        assert_eq!(sup.forwarded_ports(), vec![5000]);
    }

    #[tokio::test]
    async fn close_of_untracked_port_ignored() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(closed(9999)).await;
        sup.sweep_expired().await;
        assert!(daemon.calls_of("unforward").is_empty());
    }

    #[tokio::test]
    async fn port_listening_again_at_expiry_is_rescued() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(
            SupervisorConfig {
                grace_period: Duration::from_millis(10),
                ..config()
            },
            daemon.clone(),
            || [5000u16].into_iter().collect(),
        );

        sup.handle_event(opened(5000)).await;
        {
            // Force a pending entry despite the listening seam by marking
            // the close directly.
            let mut state = sup.state.lock();
            state.note_closed(5000, Instant::now() - Duration::from_secs(1));
        }

        sup.sweep_expired().await;
        assert!(daemon.calls_of("unforward").is_empty());
        assert_eq!(sup.forwarded_ports(), vec![5000]);
    }

    #[tokio::test]
    async fn cleanup_unforwards_everything() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(opened(3000)).await;
        sup.handle_event(opened(4000)).await;
        sup.cleanup().await;

        assert_eq!(daemon.calls_of("unforward").len(), 2);
        assert!(sup.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn forward_payload_carries_session_identity() {
        let daemon = FakeDaemon::new();
        let sup = Supervisor::with_listening(config(), daemon.clone(), HashSet::new);

        sup.handle_event(opened(8080)).await;
        let calls = daemon.calls_of("forward");
        let payload: ForwardPayload = calls[0].typed_payload().unwrap();
        assert_eq!(payload.connection, "testhost");
        assert_eq!(payload.remote_port, 8080);
        assert_eq!(payload.local_port, Some(8080));
        assert_eq!(payload.host.as_deref(), Some("localhost"));
    }

    #[test]
    fn state_machine_transitions() {
        let mut state = SessionState::default();
        let t0 = Instant::now();

        assert_eq!(state.note_opened(80), OpenedDisposition::New);
        state.begin_forward(80);
        assert_eq!(state.note_opened(80), OpenedDisposition::AlreadyForwarded);

        assert!(state.note_closed(80, t0));
        assert_eq!(state.note_opened(80), OpenedDisposition::Reissue);
        assert!(state.pending_removal.is_empty());

        // Closed twice keeps the earliest timestamp.
        assert!(state.note_closed(80, t0));
        assert!(state.note_closed(80, t0 + Duration::from_secs(10)));
        let removed = state.collect_expired(
            t0 + Duration::from_secs(30),
            Duration::from_secs(30),
            &HashSet::new(),
        );
        assert_eq!(removed, vec![80]);
        assert!(!state.tracks(80));
    }
}
