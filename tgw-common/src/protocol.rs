//! # Gateway Wire Protocol
//!
//! Purpose: Define the newline-delimited JSON requests accepted by the
//! gateway facade and the replies it writes back.
//!
//! ## Design Principles
//!
//! 1. **One Line, One Message**: Each request and each reply is a single JSON
//!    object terminated by `\n`.
//! 2. **Tagged Requests**: The `op` field selects the operation.
//! 3. **Verbatim Failures**: Errors are rendered with their kind, message and
//!    optional errno-style code, never rewritten.
//!
//! ## Examples
//!
//! ```text
//! -> {"op":"send","host":"127.0.0.1","port":7000,"command":"GET_STATUS"}
//! <- {"success":true,"host":"127.0.0.1","port":7000,"response":"STATUS_OK"}
//!
//! -> {"op":"connections"}
//! <- {"success":true,"count":1,"connections":["127.0.0.1:7000"]}
//!
//! -> {"op":"send","host":"127.0.0.1","port":7001,"command":"PING","timeout":200}
//! <- {"success":false,"host":"127.0.0.1","port":7001,
//!     "error":{"kind":"timeout","message":"command timed out after 200 ms"}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::types::{CommandOptions, ConnectionKey};

/// Request accepted by the gateway, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GatewayRequest {
    /// Execute a command against `host:port`.
    Send(SendRequest),
    /// List the keys of the open pooled connections.
    Connections,
    /// Destroy the pooled connection for `host:port`.
    Close(TargetRequest),
    /// Liveness probe.
    Health,
    /// Request counters and latency histogram.
    Stats,
}

/// Body of a `send` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendRequest {
    pub host: String,
    pub port: i64,
    pub command: String,
    /// Timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub encoding: Option<String>,
    /// `""` selects grace-period completion, absent keeps `"\n"`.
    #[serde(default)]
    pub delimiter: Option<String>,
}

/// Body of a request addressing one peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetRequest {
    pub host: String,
    pub port: i64,
}

impl SendRequest {
    /// Validates the request into a key, payload, and command options.
    pub fn into_command(self) -> GatewayResult<(ConnectionKey, Vec<u8>, CommandOptions)> {
        let key = parse_key(&self.host, self.port)?;
        let options = CommandOptions::from_parts(
            self.timeout,
            self.encoding.as_deref(),
            self.delimiter.as_deref(),
        )?;
        Ok((key, self.command.into_bytes(), options))
    }
}

impl TargetRequest {
    /// Validates the target into a connection key.
    pub fn key(&self) -> GatewayResult<ConnectionKey> {
        parse_key(&self.host, self.port)
    }
}

fn parse_key(host: &str, port: i64) -> GatewayResult<ConnectionKey> {
    let port = u32::try_from(port)
        .map_err(|_| GatewayError::validation(format!("port {} is outside 1-65535", port)))?;
    ConnectionKey::new(host, port)
}

/// Parses one request line.
///
/// # Errors
/// Returns `GatewayError::Validation` for malformed JSON, an unknown `op`,
/// or missing/mistyped fields.
pub fn parse_request(line: &[u8]) -> GatewayResult<GatewayRequest> {
    serde_json::from_slice(line).map_err(|err| GatewayError::validation(err.to_string()))
}

/// Error body attached to failed replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
            code: err.code().map(str::to_string),
        }
    }
}

/// Reply written by the gateway, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GatewayReply {
    Sent {
        success: bool,
        host: String,
        port: u16,
        response: String,
    },
    Connections {
        success: bool,
        count: usize,
        connections: Vec<String>,
    },
    Closed {
        success: bool,
        closed: bool,
    },
    Health {
        success: bool,
        status: String,
        connections: usize,
    },
    Stats {
        success: bool,
        stats: serde_json::Value,
    },
    Failed {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        error: ErrorBody,
    },
}

impl GatewayReply {
    pub fn sent(key: &ConnectionKey, response: String) -> Self {
        GatewayReply::Sent {
            success: true,
            host: key.host().to_string(),
            port: key.port(),
            response,
        }
    }

    pub fn connections(connections: Vec<String>) -> Self {
        GatewayReply::Connections {
            success: true,
            count: connections.len(),
            connections,
        }
    }

    pub fn closed(closed: bool) -> Self {
        GatewayReply::Closed {
            success: true,
            closed,
        }
    }

    pub fn health(connections: usize) -> Self {
        GatewayReply::Health {
            success: true,
            status: "ok".to_string(),
            connections,
        }
    }

    pub fn stats(stats: serde_json::Value) -> Self {
        GatewayReply::Stats {
            success: true,
            stats,
        }
    }

    /// Failure not tied to a specific peer (e.g. malformed JSON).
    pub fn failed(err: &GatewayError) -> Self {
        GatewayReply::Failed {
            success: false,
            host: None,
            port: None,
            error: ErrorBody::from(err),
        }
    }

    /// Failure of a command addressed to `key`.
    pub fn failed_for(key: &ConnectionKey, err: &GatewayError) -> Self {
        GatewayReply::Failed {
            success: false,
            host: Some(key.host().to_string()),
            port: Some(key.port()),
            error: ErrorBody::from(err),
        }
    }

    /// Serializes the reply followed by `\n`.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|err| {
            format!(
                "{{\"success\":false,\"error\":{{\"kind\":\"validation\",\"message\":{:?}}}}}",
                err.to_string()
            )
            .into_bytes()
        });
        line.push(b'\n');
        line
    }
}
