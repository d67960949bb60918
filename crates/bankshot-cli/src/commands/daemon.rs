//! `bankshot daemon run` — run the daemon in the foreground.

use tokio_util::sync::CancellationToken;

use bankshot_core::Result;
use bankshot_daemon::Daemon;

use crate::commands::Context;

pub async fn run(ctx: &Context) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let daemon = Daemon::new(ctx.config.clone());
    daemon.run(cancel).await
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
