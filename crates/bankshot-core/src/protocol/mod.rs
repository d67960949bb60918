//! Wire protocol types for the bankshot RPC socket.
//!
//! Transport is an AF_UNIX stream socket carrying one JSON object per line.
//! A client writes one [`Request`], reads one [`Response`], and closes; the
//! request `id` is echoed back so pipelined clients could correlate, though
//! in practice every connection carries exactly one exchange.

mod codec;

pub use codec::{parse_request, parse_response, read_frame, write_frame};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Request type tags understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a URL in the workstation browser.
    Open,
    /// Create a `-L` forward.
    Forward,
    /// Remove a forward.
    Unforward,
    /// Daemon status summary.
    Status,
    /// List active forwards.
    List,
    /// Daemon-side forward sweep.
    Reconcile,
}

impl Command {
    /// Wire tag for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Open => "open",
            Command::Forward => "forward",
            Command::Unforward => "unforward",
            Command::Status => "status",
            Command::List => "list",
            Command::Reconcile => "reconcile",
        }
    }

    /// Parse a wire tag. Unknown tags are a dispatch error, not a parse
    /// error, so this returns `Option` rather than `Result`.
    pub fn from_tag(tag: &str) -> Option<Command> {
        match tag {
            "open" => Some(Command::Open),
            "forward" => Some(Command::Forward),
            "unforward" => Some(Command::Unforward),
            "status" => Some(Command::Status),
            "list" => Some(Command::List),
            "reconcile" => Some(Command::Reconcile),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID, echoed in the response.
    pub id: String,
    /// Command type tag.
    #[serde(rename = "type")]
    pub command: String,
    /// Command-specific payload; absent for `status`/`list`/`reconcile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    /// Build a request with a fresh UUID and a serialized payload.
    pub fn new<P: Serialize>(command: Command, payload: &P) -> Result<Request> {
        let payload = serde_json::to_value(payload).map_err(|e| Error::Internal {
            message: format!("failed to serialize payload: {}", e),
        })?;
        Ok(Request {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.as_str().to_string(),
            payload: Some(payload),
        })
    }

    /// Build a payload-less request (`status`, `list`, `reconcile`).
    pub fn bare(command: Command) -> Request {
        Request {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.as_str().to_string(),
            payload: None,
        }
    }

    /// Resolve the command tag, failing with the unknown-command error.
    pub fn dispatch(&self) -> Result<Command> {
        Command::from_tag(&self.command)
            .ok_or_else(|| Error::UnknownCommand(self.command.clone()))
    }

    /// Deserialize the payload into its typed shape.
    pub fn typed_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| Error::BadPayload {
            message: e.to_string(),
        })
    }
}

/// A response from the daemon to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this responds to.
    pub id: String,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Error string (`"E_CODE: detail"`) when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response data when `ok` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    /// Build a success response with serialized data.
    pub fn success<D: Serialize>(id: &str, data: &D) -> Response {
        let data = serde_json::to_value(data).ok();
        Response {
            id: id.to_string(),
            ok: true,
            error: None,
            data,
        }
    }

    /// Build a success response with no data.
    pub fn success_empty(id: &str) -> Response {
        Response {
            id: id.to_string(),
            ok: true,
            error: None,
            data: None,
        }
    }

    /// Build an error response from an [`Error`].
    pub fn failure(id: &str, err: &Error) -> Response {
        Response {
            id: id.to_string(),
            ok: false,
            error: Some(err.wire_string()),
            data: None,
        }
    }

    /// Turn an error response into [`Error::Daemon`], passing data through on
    /// success.
    pub fn into_result(self) -> Result<Option<Value>> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(Error::Daemon(
                self.error.unwrap_or_else(|| "E_INTERNAL: unspecified".into()),
            ))
        }
    }

    /// Deserialize the data field into its typed shape.
    pub fn typed_data<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| Error::BadPayload {
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Payload shapes
// =============================================================================

/// Payload for `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPayload {
    /// URL handed to the workstation browser, unvalidated.
    pub url: String,
}

/// Payload for `forward`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardPayload {
    /// Port on the remote machine.
    pub remote_port: u16,
    /// Port on the workstation; defaults to `remote_port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Target host on the remote side of the tunnel; defaults to localhost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// SSH connection identifier (config alias, hostname, user@host).
    pub connection: String,
    /// Pre-resolved control socket path; normally absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// Payload for `unforward`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnforwardPayload {
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub connection: String,
}

/// One entry in the `list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub remote_port: u16,
    pub local_port: u16,
    pub host: String,
    pub connection: String,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// Data for the `list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListData {
    pub forwards: Vec<ForwardEntry>,
}

/// Per-connection rollup in the `status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connection: String,
    pub forward_count: usize,
    /// RFC3339 timestamp of the newest forward on this connection.
    pub last_activity: String,
}

/// Data for the `status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub version: String,
    /// Humanized uptime, e.g. `"1h2m3s"`.
    pub uptime: String,
    pub active_forwards: usize,
    pub connections: Vec<ConnectionStatus>,
}

/// Data for the `reconcile` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Registry entries examined.
    pub checked: usize,
    /// Entries whose forward was re-established.
    pub restored: usize,
    /// Entries removed because their connection is dead.
    pub removed: usize,
    /// Entries left untouched (still listening, or re-establish deferred).
    pub kept: usize,
}
