//! # TcpGateway Server
//!
//! Purpose: Expose the connection pool over a newline-delimited JSON
//! protocol and wire up configuration, logging, and metrics.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Gateway` hides key validation, per-key command
//!    serialization, and pool access behind `dispatch`.
//! 2. **Caller Discipline**: Commands for one key never overlap; the pool
//!    itself does not guard against it.
//! 3. **Explicit Ownership**: The registry is an instance owned by the
//!    gateway, not a process-wide singleton.

pub mod config;
pub mod lanes;
pub mod metrics;
pub mod server;
pub mod telemetry;

pub use config::{LogFormat, ServerConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{handle_connection, serve, Gateway};
