//! Error types for bankshot.
//!
//! Every error that can cross the wire maps onto a small code taxonomy; the
//! daemon serializes errors as `"E_CODE: detail"` strings in `Response.error`
//! and clients can recover the code with [`ErrorCode::parse_prefix`].

use thiserror::Error;

/// Wire-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or oversized frame.
    Protocol,
    /// Unknown request type.
    UnknownCmd,
    /// Payload missing a required field or of the wrong shape.
    BadPayload,
    /// No live control socket for the named connection.
    NoSsh,
    /// SSH subprocess exited non-zero.
    SshFail,
    /// Requested forward not in the registry.
    NotFound,
    /// Any other local failure.
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Protocol => "E_PROTOCOL",
            ErrorCode::UnknownCmd => "E_UNKNOWN_CMD",
            ErrorCode::BadPayload => "E_BAD_PAYLOAD",
            ErrorCode::NoSsh => "E_NO_SSH",
            ErrorCode::SshFail => "E_SSH_FAIL",
            ErrorCode::NotFound => "E_NOT_FOUND",
            ErrorCode::Internal => "E_INTERNAL",
        }
    }

    /// Parse a code from the leading `"E_CODE: ..."` prefix of a wire error
    /// string. Returns `None` for strings that don't carry a known code.
    pub fn parse_prefix(s: &str) -> Option<ErrorCode> {
        let code = s.split(':').next()?.trim();
        match code {
            "E_PROTOCOL" => Some(ErrorCode::Protocol),
            "E_UNKNOWN_CMD" => Some(ErrorCode::UnknownCmd),
            "E_BAD_PAYLOAD" => Some(ErrorCode::BadPayload),
            "E_NO_SSH" => Some(ErrorCode::NoSsh),
            "E_SSH_FAIL" => Some(ErrorCode::SshFail),
            "E_NOT_FOUND" => Some(ErrorCode::NotFound),
            "E_INTERNAL" => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for bankshot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, oversized frame, or other protocol violation.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request carried an unknown type tag.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Payload failed to deserialize into the expected shape.
    #[error("invalid payload: {message}")]
    BadPayload { message: String },

    /// No live ControlMaster socket for the named connection.
    #[error("no live SSH control socket for connection: {connection}")]
    NoSsh { connection: String },

    /// SSH subprocess exited non-zero; carries combined stdout/stderr.
    #[error("ssh command failed: {output}")]
    SshFail { output: String },

    /// Requested forward not in the registry.
    #[error("forward not found: {0}")]
    NotFound(String),

    /// Error string returned by the daemon in a response.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Configuration file invalid.
    #[error("config error: {message}")]
    Config { message: String },

    /// Any other local failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Map this error onto the wire taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol { .. } => ErrorCode::Protocol,
            Error::UnknownCommand(_) => ErrorCode::UnknownCmd,
            Error::BadPayload { .. } => ErrorCode::BadPayload,
            Error::NoSsh { .. } => ErrorCode::NoSsh,
            Error::SshFail { .. } | Error::Timeout => ErrorCode::SshFail,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Daemon(s) => ErrorCode::parse_prefix(s).unwrap_or(ErrorCode::Internal),
            Error::Io(_) | Error::Config { .. } | Error::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Wire representation: `"E_CODE: detail"`.
    pub fn wire_string(&self) -> String {
        match self {
            // A daemon error already carries its code prefix.
            Error::Daemon(s) => s.clone(),
            other => format!("{}: {}", other.code(), other),
        }
    }

    /// Shorthand for an internal error with a formatted message.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

/// Convenience result type for bankshot operations.
pub type Result<T> = std::result::Result<T, Error>;
