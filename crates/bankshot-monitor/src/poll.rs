//! Polling observer backend.
//!
//! Reads the kernel's listening-socket report on an interval and diffs
//! against the previous snapshot keyed by `(port, protocol)`. New listeners
//! are held for a debounce window and confirmed still-listening before an
//! OPENED is emitted, suppressing transient binds; disappearances emit
//! CLOSED immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bankshot_core::constants::{
    DEBOUNCE_WINDOW, EVENT_CHANNEL_CAPACITY, PID_EVENT_CHANNEL_CAPACITY,
};
use bankshot_core::Result;

use crate::event::{PortEvent, Protocol};
use crate::procnet::{self, ListenerSocket};
use crate::source::PortEventSource;

/// What the observer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every listener on the host.
    System,
    /// Listeners visible to one process (`/proc/<pid>/net/tcp{,6}`).
    Process(u32),
}

impl Scope {
    fn snapshot(&self) -> Vec<ListenerSocket> {
        match self {
            Scope::System => procnet::listening_sockets(),
            Scope::Process(pid) => procnet::process_listening_sockets(*pid),
        }
    }

    fn channel_capacity(&self) -> usize {
        match self {
            Scope::System => EVENT_CHANNEL_CAPACITY,
            Scope::Process(_) => PID_EVENT_CHANNEL_CAPACITY,
        }
    }

    fn pid(&self) -> u32 {
        match self {
            Scope::System => 0,
            Scope::Process(pid) => *pid,
        }
    }
}

/// The fallback observer backend.
pub struct PollingObserver {
    scope: Scope,
    poll_interval: Duration,
    debounce: Duration,
}

impl PollingObserver {
    pub fn new(scope: Scope, poll_interval: Duration) -> Self {
        Self {
            scope,
            poll_interval,
            debounce: DEBOUNCE_WINDOW,
        }
    }
}

#[async_trait]
impl PortEventSource for PollingObserver {
    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<PortEvent>> {
        let (tx, rx) = mpsc::channel(self.scope.channel_capacity());

        // Seed the snapshot so already-listening ports don't produce a
        // spurious OPENED burst from this backend.
        let mut diff = SnapshotDiff::new(self.scope.snapshot());
        tracing::debug!(
            scope = ?self.scope,
            initial = diff.known_len(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "polling observer started"
        );

        let scope = self.scope;
        let debounce = self.debounce;
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut poll_tick = tokio::time::interval(poll_interval);
            poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Debounce confirmation runs on a finer tick than the poll.
            let mut debounce_tick = tokio::time::interval(Duration::from_millis(50));
            debounce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(scope = ?scope, "polling observer stopped");
                        return;
                    }
                    _ = poll_tick.tick() => {
                        for event in diff.observe(scope.snapshot(), Instant::now(), scope.pid()) {
                            emit(&tx, event);
                        }
                    }
                    _ = debounce_tick.tick() => {
                        if diff.has_pending() {
                            let confirmed = diff.confirm_pending(
                                scope.snapshot(),
                                Instant::now(),
                                debounce,
                                scope.pid(),
                            );
                            for event in confirmed {
                                emit(&tx, event);
                            }
                        }
                    }
                }
            }
            // Dropping tx closes the stream.
        });

        Ok(rx)
    }
}

fn emit(tx: &mpsc::Sender<PortEvent>, event: PortEvent) {
    // Never block the poll loop on a slow consumer.
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        tracing::warn!(port = event.port, "event channel full, dropping event");
    }
}

type PortKey = (u16, Protocol);

/// Pure diffing core, separated from the async loop for testability.
struct SnapshotDiff {
    known: HashMap<PortKey, ListenerSocket>,
    pending: HashMap<PortKey, (Instant, ListenerSocket)>,
}

impl SnapshotDiff {
    fn new(initial: Vec<ListenerSocket>) -> Self {
        let known = initial
            .into_iter()
            .map(|s| ((s.port, s.protocol), s))
            .collect();
        Self {
            known,
            pending: HashMap::new(),
        }
    }

    fn known_len(&self) -> usize {
        self.known.len()
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Diff a fresh snapshot: queue new listeners for debounce, emit CLOSED
    /// for disappeared ones immediately.
    fn observe(
        &mut self,
        snapshot: Vec<ListenerSocket>,
        now: Instant,
        pid: u32,
    ) -> Vec<PortEvent> {
        let current: HashMap<PortKey, ListenerSocket> = snapshot
            .into_iter()
            .map(|s| ((s.port, s.protocol), s))
            .collect();

        for (key, socket) in &current {
            if !self.known.contains_key(key) && !self.pending.contains_key(key) {
                self.pending.insert(*key, (now, socket.clone()));
            }
        }

        let mut events = Vec::new();
        self.known.retain(|key, socket| {
            if current.contains_key(key) {
                true
            } else {
                events.push(PortEvent::closed(
                    socket.port,
                    socket.protocol,
                    socket.bind_addr.clone(),
                    pid,
                ));
                false
            }
        });
        // A listener that vanished while still pending never existed as far
        // as consumers are concerned.
        self.pending.retain(|key, _| current.contains_key(key));

        events
    }

    /// Promote pending listeners whose debounce window has elapsed and that
    /// are still present in the latest snapshot.
    fn confirm_pending(
        &mut self,
        snapshot: Vec<ListenerSocket>,
        now: Instant,
        debounce: Duration,
        pid: u32,
    ) -> Vec<PortEvent> {
        let current: HashMap<PortKey, ListenerSocket> = snapshot
            .into_iter()
            .map(|s| ((s.port, s.protocol), s))
            .collect();

        let ripe: Vec<PortKey> = self
            .pending
            .iter()
            .filter(|(_, (since, _))| now.duration_since(*since) >= debounce)
            .map(|(key, _)| *key)
            .collect();

        let mut events = Vec::new();
        for key in ripe {
            let Some((_, socket)) = self.pending.remove(&key) else {
                continue;
            };
            if current.contains_key(&key) {
                events.push(PortEvent::opened(
                    socket.port,
                    socket.protocol,
                    socket.bind_addr.clone(),
                    pid,
                ));
                self.known.insert(key, socket);
            }
            // Gone again before confirmation: transient bind, suppressed.
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn socket(port: u16, addr: &str) -> ListenerSocket {
        ListenerSocket {
            port,
            protocol: Protocol::Tcp,
            bind_addr: addr.to_string(),
        }
    }

    #[test]
    fn initial_snapshot_emits_nothing() {
        let mut diff = SnapshotDiff::new(vec![socket(8080, "0.0.0.0")]);
        let events = diff.observe(vec![socket(8080, "0.0.0.0")], Instant::now(), 0);
        assert!(events.is_empty());
        assert!(!diff.has_pending());
    }

    #[test]
    fn new_port_debounces_before_opened() {
        let mut diff = SnapshotDiff::new(vec![]);
        let t0 = Instant::now();

        // First sighting queues but does not emit.
        let events = diff.observe(vec![socket(3000, "127.0.0.1")], t0, 0);
        assert!(events.is_empty());
        assert!(diff.has_pending());

        // Still within the window: nothing.
        let events =
            diff.confirm_pending(vec![socket(3000, "127.0.0.1")], t0, DEBOUNCE_WINDOW, 0);
        assert!(events.is_empty());

        // Window elapsed and still listening: OPENED.
        let later = t0 + DEBOUNCE_WINDOW;
        let events =
            diff.confirm_pending(vec![socket(3000, "127.0.0.1")], later, DEBOUNCE_WINDOW, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Opened);
        assert_eq!(events[0].port, 3000);
        assert_eq!(events[0].bind_addr, "127.0.0.1");
    }

    #[test]
    fn transient_bind_suppressed() {
        let mut diff = SnapshotDiff::new(vec![]);
        let t0 = Instant::now();

        diff.observe(vec![socket(3000, "127.0.0.1")], t0, 0);
        // Gone by the time the window elapses.
        let events = diff.confirm_pending(vec![], t0 + DEBOUNCE_WINDOW, DEBOUNCE_WINDOW, 0);
        assert!(events.is_empty());
        assert!(!diff.has_pending());

        // And no CLOSED either, since it was never reported open.
        let events = diff.observe(vec![], t0 + DEBOUNCE_WINDOW, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn close_emits_immediately() {
        let mut diff = SnapshotDiff::new(vec![socket(8080, "0.0.0.0")]);
        let events = diff.observe(vec![], Instant::now(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Closed);
        assert_eq!(events[0].port, 8080);
    }

    #[test]
    fn same_port_both_protocols_tracked_separately() {
        let v4 = socket(8080, "0.0.0.0");
        let v6 = ListenerSocket {
            port: 8080,
            protocol: Protocol::Tcp6,
            bind_addr: "::".to_string(),
        };
        let mut diff = SnapshotDiff::new(vec![v4.clone(), v6.clone()]);

        // Dropping only the v6 listener closes only the v6 side.
        let events = diff.observe(vec![v4], Instant::now(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].protocol, Protocol::Tcp6);
    }

    #[tokio::test]
    async fn cancelled_observer_closes_stream() {
        let cancel = CancellationToken::new();
        let observer = Box::new(PollingObserver::new(
            Scope::Process(u32::MAX),
            Duration::from_millis(10),
        ));
        let mut rx = observer.start(cancel.clone()).await.unwrap();
        cancel.cancel();
        // Stream must terminate rather than hang.
        while rx.recv().await.is_some() {}
    }
}
