//! `bankshot wrap -- <command>` — auto-forward a child's ports.
//!
//! Watches the listening ports of the wrapped PID with a 1 s polling
//! observer, forwards each one as it opens, and unforwards exactly the
//! ports it opened when they close or the child exits. The child gets
//! `BROWSER` pointed back at `bankshot open` so URL launches from inside
//! the wrapped process land on the workstation.

use std::collections::HashSet;

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use bankshot_core::constants::{WRAP_KILL_GRACE, WRAP_POLL_INTERVAL};
use bankshot_core::protocol::{Command, ForwardPayload, Request, UnforwardPayload};
use bankshot_core::{DaemonClient, Error, Result};
use bankshot_monitor::{pid_source, EventKind};

use crate::commands::{default_connection, Context};
use crate::process::{deliver_to, WrappedChild};

pub async fn run(ctx: &Context, connection: Option<String>, argv: Vec<String>) -> Result<i32> {
    let connection = match connection {
        Some(c) => c,
        None => default_connection()?,
    };

    let current_exe = std::env::current_exe().map_err(|e| Error::Internal {
        message: format!("failed to resolve own executable: {}", e),
    })?;
    let browser = format!("{} open", current_exe.display());

    ctx.say(format!("Starting wrapped process: {}", argv.join(" ")));
    let mut child = WrappedChild::spawn(
        &argv,
        &[("BROWSER", browser), ("DISPLAY", "1".to_string())],
    )?;
    let pid = child.pid();
    tracing::debug!(pid, "wrapped process started");

    let cancel = CancellationToken::new();
    let source = pid_source(pid, WRAP_POLL_INTERVAL);
    let mut events = source.start(cancel.child_token()).await?;

    let client = ctx.client();
    let mut forwarded: HashSet<u16> = HashSet::new();

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut signals_seen = 0u32;
    let mut force_kill_at: Option<tokio::time::Instant> = None;

    let exit_code = loop {
        tokio::select! {
            code = child.wait() => break code?,

            maybe_event = events.recv() => {
                if let Some(event) = maybe_event {
                    match event.kind {
                        EventKind::Opened => {
                            if !forwarded.contains(&event.port) {
                                match forward_port(&client, &connection, event.port).await {
                                    Ok(()) => {
                                        forwarded.insert(event.port);
                                        ctx.say(format!("Auto-forwarded port {}", event.port));
                                    }
                                    Err(e) => {
                                        tracing::warn!(port = event.port, error = %e, "forward failed");
                                    }
                                }
                            }
                        }
                        EventKind::Closed => {
                            if forwarded.remove(&event.port) {
                                if let Err(e) = unforward_port(&client, &connection, event.port).await {
                                    tracing::warn!(port = event.port, error = %e, "unforward failed");
                                }
                            }
                        }
                    }
                }
            }

            _ = interrupt.recv() => {
                handle_signal(pid, Signal::SIGINT, &mut signals_seen, &mut force_kill_at);
            }
            _ = terminate.recv() => {
                handle_signal(pid, Signal::SIGTERM, &mut signals_seen, &mut force_kill_at);
            }
            _ = hangup.recv() => {
                handle_signal(pid, Signal::SIGHUP, &mut signals_seen, &mut force_kill_at);
            }

            _ = deadline(force_kill_at), if force_kill_at.is_some() => {
                tracing::warn!(pid, "grace expired, force-killing child");
                deliver_to(pid, Signal::SIGKILL);
                force_kill_at = None;
            }
        }
    };

    cancel.cancel();

    // Exactly the ports this wrap opened, and no others.
    for port in forwarded {
        if let Err(e) = unforward_port(&client, &connection, port).await {
            tracing::warn!(port, error = %e, "cleanup unforward failed");
        }
    }

    ctx.say(format!("Process exited with code {}", exit_code));
    Ok(exit_code)
}

/// First signal is forwarded and arms the kill deadline; any further
/// signal kills immediately.
fn handle_signal(
    pid: u32,
    signal: Signal,
    signals_seen: &mut u32,
    force_kill_at: &mut Option<tokio::time::Instant>,
) {
    *signals_seen += 1;
    if *signals_seen == 1 {
        tracing::debug!(pid, %signal, "forwarding signal to child");
        deliver_to(pid, signal);
        *force_kill_at = Some(tokio::time::Instant::now() + WRAP_KILL_GRACE);
    } else {
        tracing::warn!(pid, "second signal, force-killing child");
        deliver_to(pid, Signal::SIGKILL);
    }
}

async fn deadline(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn forward_port(client: &DaemonClient, connection: &str, port: u16) -> Result<()> {
    let request = Request::new(
        Command::Forward,
        &ForwardPayload {
            remote_port: port,
            local_port: Some(port),
            host: Some("localhost".into()),
            connection: connection.to_string(),
            socket_path: None,
        },
    )?;
    client.call_ok(request).await.map(|_| ())
}

async fn unforward_port(client: &DaemonClient, connection: &str, port: u16) -> Result<()> {
    let request = Request::new(
        Command::Unforward,
        &UnforwardPayload {
            remote_port: port,
            host: Some("localhost".into()),
            connection: connection.to_string(),
        },
    )?;
    client.call_ok(request).await.map(|_| ())
}
