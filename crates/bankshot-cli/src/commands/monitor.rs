//! `bankshot monitor` — run the remote-side supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use bankshot_core::{Error, Result};
use bankshot_monitor::{system_source, Supervisor, SupervisorConfig};

use crate::commands::{default_connection, Context};

pub async fn run(
    ctx: &Context,
    connection: Option<String>,
    pid_file: Option<PathBuf>,
) -> Result<()> {
    let session_id = match connection {
        Some(c) => c,
        None => default_connection()?,
    };

    let _pid_guard = match pid_file {
        Some(path) => Some(PidFile::write(&path)?),
        None => None,
    };

    let config = SupervisorConfig {
        session_id,
        policy: ctx.config.monitor.policy(),
        grace_period: ctx.config.monitor.grace_period()?,
    };
    let client = Arc::new(ctx.client());
    let supervisor = Supervisor::new(config, client);
    let source = system_source(ctx.config.monitor.poll_interval()?);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    supervisor.run(source, cancel).await
}

/// PID file that removes itself on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(path: &Path) -> Result<PidFile> {
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|e| Error::Internal {
            message: format!("failed to write PID file {}: {}", path.display(), e),
        })?;
        tracing::debug!(path = %path.display(), "wrote PID file");
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut interrupt), Ok(mut terminate)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            tracing::error!("failed to install signal handlers");
            return;
        };

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
