//! # Error Taxonomy
//!
//! Purpose: Give every failure surfaced by the gateway a typed kind so the
//! facade can render it verbatim without guessing.
//!
//! ## Design Principles
//! 1. **Scoped Failures**: Every error belongs to one command or connection;
//!    none is fatal to the process.
//! 2. **No Retries**: The core reports failures, callers decide what to do.
//! 3. **Cloneable**: A failed connect attempt is shared by every concurrent
//!    acquirer, so errors carry owned strings instead of `io::Error`.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Result type used across the gateway crates.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the connection registry, the command executor, and
/// the facade's input validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Malformed caller input (bad host, port, encoding, timeout, JSON).
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The transport connection could not be established.
    #[error("failed to connect to {key}: {message}")]
    ConnectFailure {
        key: String,
        message: String,
        code: String,
    },

    /// No completion condition was met before the command timeout.
    #[error("command timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The connection signalled an error after it was established.
    #[error("transport error ({code}): {message}")]
    Transport { message: String, code: String },
}

/// Stable identifier of an error kind, used in facade replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ConnectFailure,
    Timeout,
    TransportError,
}

impl GatewayError {
    /// Builds a validation error from any displayable message.
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
        }
    }

    /// Maps a failed connect attempt for `key`.
    pub fn connect(key: &impl ToString, err: &io::Error) -> Self {
        GatewayError::ConnectFailure {
            key: key.to_string(),
            message: err.to_string(),
            code: io_error_code(err),
        }
    }

    /// Maps an IO failure on an established connection.
    pub fn transport(err: &io::Error) -> Self {
        GatewayError::Transport {
            message: err.to_string(),
            code: io_error_code(err),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation { .. } => ErrorKind::Validation,
            GatewayError::ConnectFailure { .. } => ErrorKind::ConnectFailure,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Transport { .. } => ErrorKind::TransportError,
        }
    }

    /// Returns the errno-style code for transport level failures.
    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::ConnectFailure { code, .. } | GatewayError::Transport { code, .. } => {
                Some(code.as_str())
            }
            _ => None,
        }
    }
}

/// Renders an IO error as an errno-style code (`ECONNRESET`, `EPIPE`, ...).
///
/// Kinds without a well-known errno name fall back to the `ErrorKind` debug name.
pub fn io_error_code(err: &io::Error) -> String {
    let code = match err.kind() {
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::NotConnected => "ENOTCONN",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::Interrupted => "EINTR",
        // Resolver failures surface as `Other`/`Uncategorized` with a lookup message.
        _ if err.to_string().contains("lookup") => "ENOTFOUND",
        kind => return format!("{:?}", kind),
    };
    code.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GatewayError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(GatewayError::Timeout { after_ms: 5 }.kind(), ErrorKind::Timeout);
        let kind = serde_json::to_string(&ErrorKind::TransportError).unwrap();
        assert_eq!(kind, "\"transport_error\"");
    }

    #[test]
    fn io_errors_map_to_errno_names() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(io_error_code(&reset), "ECONNRESET");

        let err = GatewayError::transport(&reset);
        assert_eq!(err.code(), Some("ECONNRESET"));
        assert_eq!(err.to_string(), "transport error (ECONNRESET): reset by peer");
    }

    #[test]
    fn connect_failure_names_the_key() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = GatewayError::connect(&"127.0.0.1:1", &refused);
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert_eq!(err.code(), Some("ECONNREFUSED"));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn timeout_has_no_code() {
        let err = GatewayError::Timeout { after_ms: 250 };
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "command timed out after 250 ms");
    }
}
