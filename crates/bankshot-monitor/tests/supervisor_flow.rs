//! Supervisor end-to-end flow: scripted observer events in, RPCs out.
//!
//! Time is paused so the 5 s grace sweep and 10 s heartbeat run instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bankshot_core::protocol::{ListData, Request, Response};
use bankshot_core::{DaemonRpc, PortPolicy, PortRange, Result};
use bankshot_monitor::supervisor::{Supervisor, SupervisorConfig};
use bankshot_monitor::{PortEvent, PortEventSource, Protocol};

/// Ports unlikely to be listening on the machine running the tests: the
/// supervisor verifies closes against the real listening set, and its
/// reconcile pass scans it too, so the policy below is pinned to this
/// range to keep real host listeners out of the assertions.
const TEST_PORT: u16 = 49877;
const TEST_RANGE: PortRange = PortRange {
    start: 49870,
    end: 49890,
};

/// Emits a fixed script of events, then keeps the stream open until
/// cancelled.
struct ScriptedSource {
    script: Vec<PortEvent>,
}

#[async_trait]
impl PortEventSource for ScriptedSource {
    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<PortEvent>> {
        let (tx, rx) = mpsc::channel(50);
        for event in self.script {
            let _ = tx.try_send(event);
        }
        // Hold the sender so the stream stays open for the run's lifetime.
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
        });
        Ok(rx)
    }
}

/// Answers every RPC with success and records it.
struct RecordingDaemon {
    calls: Mutex<Vec<Request>>,
}

impl RecordingDaemon {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn count_of(&self, command: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.command == command)
            .count()
    }
}

#[async_trait]
impl DaemonRpc for RecordingDaemon {
    async fn call(&self, request: Request) -> Result<Response> {
        self.calls.lock().push(request.clone());
        if request.command == "list" {
            return Ok(Response::success(&request.id, &ListData { forwards: vec![] }));
        }
        Ok(Response::success_empty(&request.id))
    }
}

fn supervisor_with(daemon: Arc<RecordingDaemon>, grace: Duration) -> Arc<Supervisor> {
    Supervisor::new(
        SupervisorConfig {
            session_id: "flowhost".into(),
            policy: PortPolicy::new(vec![TEST_RANGE], [], vec![]),
            grace_period: grace,
        },
        daemon,
    )
}

/// Spin until `predicate` holds or too many scheduler turns pass. With
/// paused time the sleeps auto-advance, so this is fast in wall-clock
/// terms.
async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(predicate(), "condition not reached");
}

#[tokio::test(start_paused = true)]
async fn open_close_grace_unforward_cycle() {
    let daemon = RecordingDaemon::new();
    // Short grace so the 5 s sweep collects on its first pass.
    let supervisor = supervisor_with(daemon.clone(), Duration::from_secs(3));

    let source = Box::new(ScriptedSource {
        script: vec![
            PortEvent::opened(TEST_PORT, Protocol::Tcp, "0.0.0.0", 1000),
            PortEvent::closed(TEST_PORT, Protocol::Tcp, "0.0.0.0", 1000),
        ],
    });

    let cancel = CancellationToken::new();
    let run = tokio::spawn(supervisor.clone().run(source, cancel.clone()));

    // The OPENED produced exactly one forward RPC.
    wait_for(|| daemon.count_of("forward") >= 1).await;
    assert_eq!(daemon.count_of("forward"), 1);
    assert_eq!(supervisor.forwarded_ports(), vec![TEST_PORT]);

    // The CLOSED only takes effect after the grace period.
    wait_for(|| daemon.count_of("unforward") >= 1).await;
    assert!(supervisor.forwarded_ports().is_empty());

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_triggers_startup_reconcile() {
    let daemon = RecordingDaemon::new();
    let supervisor = supervisor_with(daemon.clone(), Duration::from_secs(30));

    let source = Box::new(ScriptedSource { script: vec![] });
    let cancel = CancellationToken::new();
    let run = tokio::spawn(supervisor.clone().run(source, cancel.clone()));

    // First successful status probe flips unreachable -> reachable, which
    // must kick a reconcile (a `list` call).
    wait_for(|| daemon.count_of("status") >= 1 && daemon.count_of("list") >= 1).await;

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_cleans_up_forwards() {
    let daemon = RecordingDaemon::new();
    let supervisor = supervisor_with(daemon.clone(), Duration::from_secs(30));

    let source = Box::new(ScriptedSource {
        script: vec![
            PortEvent::opened(49878, Protocol::Tcp, "127.0.0.1", 1),
            PortEvent::opened(49879, Protocol::Tcp, "127.0.0.1", 2),
        ],
    });

    let cancel = CancellationToken::new();
    let run = tokio::spawn(supervisor.clone().run(source, cancel.clone()));

    wait_for(|| daemon.count_of("forward") >= 2).await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    // Both forwards removed on the way out.
    assert_eq!(daemon.count_of("unforward"), 2);
    assert!(supervisor.forwarded_ports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn policy_rejections_never_reach_the_daemon() {
    let daemon = RecordingDaemon::new();
    let supervisor = supervisor_with(daemon.clone(), Duration::from_secs(30));

    let source = Box::new(ScriptedSource {
        script: vec![
            // Outside the configured range, and a non-local bind inside it:
            // both filtered.
            PortEvent::opened(443, Protocol::Tcp, "0.0.0.0", 1),
            PortEvent::opened(TEST_PORT, Protocol::Tcp, "100.64.0.5", 2),
        ],
    });

    let cancel = CancellationToken::new();
    let run = tokio::spawn(supervisor.clone().run(source, cancel.clone()));

    // Give the event loop time to consume both events; the heartbeat
    // firing proves the loop has turned.
    wait_for(|| daemon.count_of("status") >= 1).await;
    assert_eq!(daemon.count_of("forward"), 0);

    cancel.cancel();
    run.await.unwrap().unwrap();
}
