//! Observer contract and backend selection.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bankshot_core::Result;

use crate::event::PortEvent;
use crate::poll::{PollingObserver, Scope};

/// A source of edge-triggered port events.
///
/// `start` consumes the observer and hands back the event stream; the stream
/// closes when `cancel` fires and all backend resources have been released.
/// Both backends satisfy identical semantics, so consumers never branch on
/// which one they got.
#[async_trait]
pub trait PortEventSource: Send {
    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<PortEvent>>;
}

/// Observer for every listener on the host.
///
/// Tries the kernel-trace backend first when compiled in; any load failure
/// (missing capability, unsupported kernel) falls back to polling.
pub fn system_source(poll_interval: std::time::Duration) -> Box<dyn PortEventSource> {
    #[cfg(feature = "ebpf")]
    {
        match crate::ebpf::probe() {
            Ok(()) => {
                tracing::info!("using kernel-trace port observer");
                return Box::new(crate::ebpf::KernelTraceObserver::new());
            }
            Err(e) => {
                tracing::info!(error = %e, "kernel-trace observer unavailable, falling back to polling");
            }
        }
    }
    Box::new(PollingObserver::new(Scope::System, poll_interval))
}

/// Observer scoped to one process's network namespace, used by `wrap`.
///
/// Always the polling backend: the kernel-trace stream is host-wide and
/// cannot be narrowed to a process subtree without tracking descendants.
pub fn pid_source(pid: u32, poll_interval: std::time::Duration) -> Box<dyn PortEventSource> {
    Box::new(PollingObserver::new(Scope::Process(pid), poll_interval))
}
