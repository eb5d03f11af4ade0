// tgw-common - Shared types and wire definitions for TcpGateway
//
// This crate defines the connection key, command options, the error taxonomy
// and the JSON-lines protocol spoken by the gateway facade.

pub mod error;
pub mod types;
pub mod protocol;

// Re-export for convenience
pub use error::*;
pub use types::*;
pub use protocol::*;
