//! RPC server: accept loop and per-connection handling.
//!
//! One short-lived task per connection: read one bounded line, dispatch,
//! write one line, close. Dispatch runs in its own task so a panicking
//! handler is converted into `E_INTERNAL` instead of taking the connection
//! task down silently. Shutdown stops accepting, drains in-flight handlers
//! within a bounded budget, and aborts stragglers.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use bankshot_core::constants::SHUTDOWN_DRAIN_TIMEOUT;
use bankshot_core::protocol::{parse_request, read_frame, write_frame, Response};
use bankshot_core::{Error, Result};

use crate::daemon::Daemon;

/// The daemon's listener, unix or tcp per configuration.
pub enum RpcListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Serve RPCs until cancelled.
pub async fn serve(
    listener: RpcListener,
    daemon: Arc<Daemon>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = accept(&listener) => {
                match accepted {
                    Ok(Some(stream)) => {
                        let daemon = daemon.clone();
                        handlers.spawn(async move {
                            handle_connection(daemon, stream).await;
                        });
                    }
                    Ok(None) => {} // rejected peer
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                }
            }

            // Reap finished handlers so the set doesn't grow unbounded.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    tracing::info!(in_flight = handlers.len(), "draining rpc handlers");
    let drain = async {
        while handlers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("drain budget exceeded, aborting remaining handlers");
        handlers.abort_all();
    }

    Ok(())
}

/// A connected client stream; concrete type erased so unix and tcp share
/// the handler path.
type ClientStream = Box<dyn ClientIo>;

trait ClientIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientIo for T {}

/// Accept one connection. `Ok(None)` means the peer was rejected (wrong
/// UID on the unix socket).
async fn accept(listener: &RpcListener) -> std::io::Result<Option<ClientStream>> {
    match listener {
        RpcListener::Unix(unix) => {
            let (stream, _addr) = unix.accept().await?;
            // Socket modes are the real gate; peer credentials are a
            // belt-and-suspenders check where the platform offers them.
            if let Ok(cred) = stream.peer_cred() {
                let own_uid = unsafe { libc::geteuid() };
                if cred.uid() != own_uid {
                    tracing::warn!(peer_uid = cred.uid(), "rejecting connection from other uid");
                    return Ok(None);
                }
            }
            Ok(Some(Box::new(stream)))
        }
        RpcListener::Tcp(tcp) => {
            let (stream, addr) = tcp.accept().await?;
            tracing::debug!(%addr, "tcp connection accepted");
            Ok(Some(Box::new(stream)))
        }
    }
}

/// One request, one response, close.
async fn handle_connection(daemon: Arc<Daemon>, stream: ClientStream) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let line = match read_frame(&mut read_half).await {
        Ok(Some(line)) => line,
        Ok(None) => return, // client connected and went away
        Err(e) => {
            let response = Response::failure("", &e);
            let _ = write_frame(&mut write_half, &response).await;
            return;
        }
    };

    let request = match parse_request(&line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable request");
            let response = Response::failure("", &e);
            let _ = write_frame(&mut write_half, &response).await;
            return;
        }
    };

    tracing::info!(id = %request.id, command = %request.command, "request received");

    let request_id = request.id.clone();
    let dispatch_daemon = daemon.clone();
    let dispatched = tokio::spawn(async move { dispatch_daemon.dispatch(request).await });

    let response = match dispatched.await {
        Ok(response) => response,
        Err(e) if e.is_panic() => {
            tracing::error!(id = %request_id, "handler panicked");
            Response::failure(&request_id, &Error::internal("handler panicked"))
        }
        Err(_) => return, // shutdown raced the handler
    };

    if let Err(e) = write_frame(&mut write_half, &response).await {
        tracing::debug!(error = %e, "failed to write response");
    }
}
