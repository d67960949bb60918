//! RPC client for the daemon socket.
//!
//! One request per connection: connect, write a frame, read a frame, close.
//! The whole exchange runs under a single deadline so a wedged daemon (or a
//! half-dead `ssh -R` tunnel on the remote side) cannot hang callers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;

use crate::constants::RPC_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{parse_response, read_frame, write_frame, Request, Response};

/// Seam for anything that can answer daemon RPCs.
///
/// The supervisor and CLI only depend on this trait; tests substitute a
/// recording fake.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    /// Perform one request/response exchange.
    async fn call(&self, request: Request) -> Result<Response>;
}

/// Unix-socket RPC client.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Create a client for the daemon socket at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            timeout: RPC_TIMEOUT,
        }
    }

    /// Override the round-trip deadline (used by the startup stale-socket
    /// probe, which wants to give up fast).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The socket path this client targets.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Perform an exchange and unwrap the response, converting daemon-side
    /// errors into [`Error::Daemon`].
    pub async fn call_ok(&self, request: Request) -> Result<Option<serde_json::Value>> {
        self.call(request).await?.into_result()
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(&mut write_half, request).await?;

        let line = read_frame(&mut read_half)
            .await?
            .ok_or_else(|| Error::Protocol {
                message: "connection closed before response".into(),
            })?;
        let response = parse_response(&line)?;

        if response.id != request.id {
            return Err(Error::Protocol {
                message: format!(
                    "response id {} does not match request id {}",
                    response.id, request.id
                ),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl DaemonRpc for DaemonClient {
    async fn call(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, ListData};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    async fn one_shot_server(listener: UnixListener, response_for: fn(&Request) -> Response) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        let line = read_frame(&mut read_half).await.unwrap().unwrap();
        let request = crate::protocol::parse_request(&line).unwrap();
        let response = response_for(&request);
        write_frame(&mut write_half, &response).await.unwrap();
        write_half.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn round_trip_against_local_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(one_shot_server(listener, |req| {
            Response::success(&req.id, &ListData { forwards: vec![] })
        }));

        let client = DaemonClient::new(&path);
        let response = client.call(Request::bare(Command::List)).await.unwrap();
        assert!(response.ok);
        let data: ListData = response.typed_data().unwrap();
        assert!(data.forwards.is_empty());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn daemon_error_surfaces_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(one_shot_server(listener, |req| {
            Response::failure(&req.id, &Error::NotFound("myhost/localhost:9".into()))
        }));

        let client = DaemonClient::new(&path);
        let err = client
            .call_ok(Request::bare(Command::List))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NotFound);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_id_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(one_shot_server(listener, |_| {
            Response::success_empty("not-the-request-id")
        }));

        let client = DaemonClient::new(&path);
        let err = client.call(Request::bare(Command::Status)).await.unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Protocol);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("missing.sock"));
        let err = client.call(Request::bare(Command::Status)).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
