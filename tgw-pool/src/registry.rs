//! # Connection Registry
//!
//! Purpose: Cache one live connection per key and share a single in-flight
//! connect attempt between concurrent acquirers of the same key.
//!
//! ## Design Principles
//! 1. **Pending Slots**: A key maps either to an OPEN connection or to the
//!    connect attempt itself (a `Shared` future), so a second acquirer awaits
//!    the first attempt instead of dialing again and orphaning a socket.
//! 2. **Minimal Locking**: The slot mutex is held only for map edits, never
//!    across `.await`, and never while destroying a connection.
//! 3. **Id-Matched Eviction**: A closing connection removes its slot only if
//!    the slot still holds that exact connection.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! (absent) --acquire--> Connecting{attempt} --ok--> Open(conn) --close/error--> (absent)
//!                              |                                      ^
//!                              +--------------err---------------------+
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tgw_common::{ConnectionKey, GatewayError, GatewayResult};

use crate::connection::{CloseObserver, CloseReason, Connection};

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound for a single TCP connect attempt.
    pub connect_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, GatewayResult<Arc<Connection>>>>;

enum Slot {
    Connecting { attempt: u64, future: PendingConnect },
    Open(Arc<Connection>),
}

struct RegistryInner {
    config: RegistryConfig,
    slots: Mutex<BTreeMap<ConnectionKey, Slot>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn evict(&self, connection: &Connection, reason: &CloseReason) {
        let mut slots = self.slots.lock();
        let owns_slot = matches!(
            slots.get(connection.key()),
            Some(Slot::Open(current)) if current.id() == connection.id()
        );
        if owns_slot {
            slots.remove(connection.key());
            info!(key = %connection.key(), conn_id = connection.id(), reason = ?reason, "evicted connection");
        }
    }
}

/// Keyed cache of live connections.
///
/// Cloning is cheap and every clone addresses the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.inner.config)
            .field("open", &self.count())
            .finish()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new(RegistryConfig::default())
    }
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                config,
                slots: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Returns the OPEN connection for `key`, connecting first if needed.
    ///
    /// Concurrent calls for a key without an OPEN entry share one connect
    /// attempt and observe the same outcome.
    ///
    /// # Errors
    /// Returns `GatewayError::ConnectFailure` when the connect attempt fails,
    /// times out, or is cancelled by `release`/`release_all` (code `ECANCELED`).
    pub async fn acquire(&self, key: &ConnectionKey) -> GatewayResult<Arc<Connection>> {
        let pending = {
            let mut slots = self.inner.slots.lock();
            match slots.get(key) {
                Some(Slot::Open(connection)) if connection.is_open() => {
                    debug!(key = %key, conn_id = connection.id(), "reusing connection");
                    return Ok(Arc::clone(connection));
                }
                Some(Slot::Connecting { future, .. }) => {
                    debug!(key = %key, "joining in-flight connect");
                    future.clone()
                }
                // Absent, or an OPEN slot whose connection is mid-close.
                _ => {
                    let attempt = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = connect_and_register(
                        Arc::downgrade(&self.inner),
                        key.clone(),
                        attempt,
                        self.inner.config.connect_timeout,
                    )
                    .boxed()
                    .shared();
                    slots.insert(
                        key.clone(),
                        Slot::Connecting {
                            attempt,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        pending.await
    }

    /// Returns the OPEN connection for `key` without connecting.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        match self.inner.slots.lock().get(key) {
            Some(Slot::Open(connection)) if connection.is_open() => Some(Arc::clone(connection)),
            _ => None,
        }
    }

    /// Destroys and removes the entry for `key`.
    ///
    /// Returns true when an OPEN connection was destroyed. A pending connect
    /// attempt for the key is cancelled either way.
    pub fn release(&self, key: &ConnectionKey) -> bool {
        let slot = self.inner.slots.lock().remove(key);
        match slot {
            Some(Slot::Open(connection)) => {
                connection.destroy();
                info!(key = %key, conn_id = connection.id(), "released connection");
                true
            }
            Some(Slot::Connecting { .. }) | None => false,
        }
    }

    /// Destroys every stored connection and empties the registry. Idempotent.
    pub fn release_all(&self) {
        let slots = std::mem::take(&mut *self.inner.slots.lock());
        let mut released = 0usize;
        for (_, slot) in slots {
            if let Slot::Open(connection) = slot {
                connection.destroy();
                released += 1;
            }
        }
        info!(released, "released all connections");
    }

    /// Canonical keys of the OPEN connections, sorted.
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Open(connection) if connection.is_open() => Some(key.to_string()),
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }

    /// Number of OPEN connections.
    pub fn count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Open(connection) if connection.is_open()))
            .count()
    }
}

/// Dials `key` and promotes the `Connecting` slot to `Open`.
///
/// Runs once per attempt no matter how many acquirers await it.
async fn connect_and_register(
    registry: Weak<RegistryInner>,
    key: ConnectionKey,
    attempt: u64,
    connect_timeout: Duration,
) -> GatewayResult<Arc<Connection>> {
    debug!(key = %key, conn_id = attempt, "connecting");
    let result = Connection::connect(&key, attempt, connect_timeout).await;

    let Some(inner) = registry.upgrade() else {
        return Err(cancelled(&key));
    };
    let mut slots = inner.slots.lock();
    let current = matches!(
        slots.get(&key),
        Some(Slot::Connecting { attempt: slot_attempt, .. }) if *slot_attempt == attempt
    );

    match result {
        Err(err) => {
            if current {
                slots.remove(&key);
            }
            warn!(key = %key, error = %err, "connect failed");
            Err(err)
        }
        Ok(_) if !current => {
            // Released while dialing; dropping the halves closes the socket.
            debug!(key = %key, conn_id = attempt, "discarding superseded connection");
            Err(cancelled(&key))
        }
        Ok((connection, read_half)) => {
            let connection = Arc::new(connection);
            slots.insert(key.clone(), Slot::Open(Arc::clone(&connection)));
            connection.start(read_half, eviction_observer(Arc::downgrade(&inner)));
            info!(key = %key, conn_id = attempt, peer = ?connection.peer_addr(), "connected");
            Ok(connection)
        }
    }
}

fn eviction_observer(registry: Weak<RegistryInner>) -> CloseObserver {
    Box::new(move |connection: &Connection, reason: &CloseReason| {
        if let Some(inner) = registry.upgrade() {
            inner.evict(connection, reason);
        }
    })
}

fn cancelled(key: &ConnectionKey) -> GatewayError {
    GatewayError::ConnectFailure {
        key: key.to_string(),
        message: "connect attempt cancelled by registry release".to_string(),
        code: "ECANCELED".to_string(),
    }
}
