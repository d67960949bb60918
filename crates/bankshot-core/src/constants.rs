//! Protocol and timing constants for bankshot.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Maximum wire frame size (1 MiB). Larger frames are rejected with
/// `E_PROTOCOL` on both read and write.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default daemon socket file name, relative to `$HOME`.
pub const DEFAULT_SOCKET_NAME: &str = ".bankshot.sock";

// =============================================================================
// Timing Constants
// =============================================================================

/// Timeout for a single `ssh -O`/`ssh -G` subprocess invocation.
pub const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// RPC round-trip deadline (connect + write + read).
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between a port closing and its forward being removed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Interval at which the supervisor sweeps forwards pending removal.
pub const GRACE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the supervisor's daemon-reachability heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default poll interval for the system-wide polling observer.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval for the per-PID observer used by `wrap`.
pub const WRAP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Window a newly seen port must remain listening before OPENED is emitted.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Budget for draining in-flight RPC handlers at daemon shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline when probing a possibly stale daemon socket at startup.
pub const STALE_SOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace given to a wrapped child between SIGTERM and SIGKILL.
pub const WRAP_KILL_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Observer Constants
// =============================================================================

/// Event channel capacity for system-wide observers.
pub const EVENT_CHANNEL_CAPACITY: usize = 50;

/// Event channel capacity for per-PID observers.
pub const PID_EVENT_CHANNEL_CAPACITY: usize = 10;

// =============================================================================
// Policy Constants
// =============================================================================

/// Ports below this are never auto-forwarded unless an explicit range says so.
pub const PRIVILEGED_PORT_CEILING: u16 = 1024;

/// Process names skipped by the supervisor when no override is configured.
pub const DEFAULT_IGNORE_PROCESSES: &[&str] = &["sshd", "systemd", "ssh-agent"];
