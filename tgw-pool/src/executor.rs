//! # Command Executor
//!
//! Purpose: Write one framed payload to a pooled connection and race the
//! completion signals (delimiter, grace period, timeout, transport error) to
//! exactly one result.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: `PENDING -> {RESOLVED, TIMED_OUT, FAILED}`;
//!    terminal states are final and `settle` is the only way out of PENDING.
//! 2. **Scoped Listeners**: The command's `Subscription` is dropped on every
//!    return path, so a reused connection never carries stale listeners.
//! 3. **Timeout Destroys**: A timed-out peer is assumed unhealthy; the
//!    connection is destroyed, which also evicts it from the registry.
//!
//! ## Timeline
//!
//! ```text
//! t=0        write(payload ++ delimiter)
//! t=grace    (delimiter == "")  RESOLVED with whatever arrived
//! t=timeout  TIMED_OUT, connection destroyed
//! any t      delimiter seen -> RESOLVED | error event -> FAILED
//! ```

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use tgw_common::{CommandOptions, GatewayError, GatewayResult};

use crate::connection::{Connection, ConnectionEvent};
use crate::framing::{frame_payload, ResponseBuffer};

/// Per-command completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Resolved,
    TimedOut,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        self != CommandState::Pending
    }
}

/// One-shot latch over the command's outcome.
#[derive(Debug)]
struct Exchange {
    state: CommandState,
}

impl Exchange {
    fn new() -> Self {
        Exchange {
            state: CommandState::Pending,
        }
    }

    /// Moves PENDING into a terminal state and hands back `outcome`.
    fn settle<T>(
        &mut self,
        next: CommandState,
        outcome: GatewayResult<T>,
    ) -> GatewayResult<T> {
        debug_assert!(next.is_terminal());
        debug_assert_eq!(self.state, CommandState::Pending, "command settled twice");
        self.state = next;
        outcome
    }
}

/// Executes one command on `connection`.
///
/// Writes `payload ++ delimiter`, then waits for the first of:
/// - the delimiter in the accumulated, decoded response (success, trimmed,
///   first delimiter occurrence removed);
/// - the grace period `min(timeout, 1s)` when the delimiter is empty
///   (success with whatever arrived, possibly empty);
/// - a connection error (`GatewayError::Transport`);
/// - the timeout (`GatewayError::Timeout`, connection destroyed).
///
/// A peer close without error is not a completion signal; the command keeps
/// waiting for its grace period or timeout.
///
/// Callers must not run two commands concurrently on one connection: both
/// would observe the same inbound bytes.
pub async fn execute(
    connection: &Arc<Connection>,
    payload: &[u8],
    options: &CommandOptions,
) -> GatewayResult<String> {
    let started = Instant::now();
    let timeout_ms = options.timeout_ms();
    let deadline = sleep(options.timeout());
    let grace = sleep(options.grace_period());
    let grace_mode = options.delimiter().is_empty();
    tokio::pin!(deadline);
    tokio::pin!(grace);

    let mut exchange = Exchange::new();
    let mut response = match ResponseBuffer::new(options.encoding(), options.delimiter()) {
        Ok(response) => response,
        Err(err) => return exchange.settle(CommandState::Failed, Err(err)),
    };
    // Attach before writing so no reply byte can slip past the listener.
    let mut subscription = connection.subscribe();

    let frame = frame_payload(payload, response.wire_delimiter());
    let written = tokio::select! {
        biased;
        result = connection.write(&frame) => result,
        _ = &mut deadline => {
            connection.destroy();
            warn!(key = %connection.key(), conn_id = connection.id(), after_ms = timeout_ms, "command timed out during write");
            return exchange.settle(CommandState::TimedOut, Err(GatewayError::Timeout { after_ms: timeout_ms }));
        }
    };
    if let Err(err) = written {
        warn!(key = %connection.key(), conn_id = connection.id(), error = %err, "write failed");
        return exchange.settle(CommandState::Failed, Err(err));
    }

    let mut stream_ended = false;
    loop {
        tokio::select! {
            // Grace is never later than the timeout, so it wins a tie.
            biased;
            _ = &mut grace, if grace_mode => {
                let text = response.drain_all();
                debug!(
                    key = %connection.key(),
                    conn_id = connection.id(),
                    bytes = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "grace period elapsed"
                );
                return exchange.settle(CommandState::Resolved, Ok(text));
            }
            _ = &mut deadline => {
                connection.destroy();
                warn!(key = %connection.key(), conn_id = connection.id(), after_ms = timeout_ms, "command timed out");
                return exchange.settle(CommandState::TimedOut, Err(GatewayError::Timeout { after_ms: timeout_ms }));
            }
            event = subscription.recv(), if !stream_ended => match event {
                Some(ConnectionEvent::Data(chunk)) => {
                    response.push(&chunk);
                    if let Some(text) = response.complete() {
                        debug!(
                            key = %connection.key(),
                            conn_id = connection.id(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "response complete"
                        );
                        return exchange.settle(CommandState::Resolved, Ok(text));
                    }
                }
                Some(ConnectionEvent::Error(err)) => {
                    warn!(key = %connection.key(), conn_id = connection.id(), error = %err, "transport error");
                    return exchange.settle(CommandState::Failed, Err(err));
                }
                Some(ConnectionEvent::Closed) | None => {
                    debug!(key = %connection.key(), conn_id = connection.id(), "peer closed mid-command");
                    stream_ended = true;
                }
            },
        }
    }
}
