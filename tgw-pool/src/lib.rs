//! # TcpGateway Connection Pool
//!
//! Purpose: Keep one live TCP connection per `(host, port)` and run
//! delimiter-framed command/response exchanges over it.
//!
//! ## Design Principles
//! 1. **Keyed Reuse**: `ConnectionRegistry` hands out the same connection for
//!    a key until it closes, errors, or is destroyed.
//! 2. **Shared Connects**: Concurrent acquirers of an unseen key await one
//!    in-flight connect attempt instead of racing their own.
//! 3. **Self-Eviction**: A connection leaves the registry inside the
//!    notification that observes its closure.
//! 4. **Single Resolution**: Every command settles exactly once and drops its
//!    listeners on every exit path.
//!
//! Callers must not run two commands concurrently on the same connection.

mod connection;
mod executor;
mod framing;
mod registry;

pub use connection::{CloseReason, Connection, ConnectionEvent, ConnectionState, Subscription};
pub use executor::{execute, CommandState};
pub use framing::{frame_payload, ResponseBuffer};
pub use registry::{ConnectionRegistry, RegistryConfig};
