//! # Pooled Connection
//!
//! Purpose: Wrap one TCP stream with an OPEN/CLOSED lifecycle, a background
//! reader that fans inbound chunks out to temporary listeners, and a single
//! close notification consumed by the registry.
//!
//! ## Design Principles
//! 1. **Observer Pattern**: Commands attach listeners through RAII
//!    `Subscription`s; dropping one unregisters it.
//! 2. **One-Way Lifecycle**: OPEN -> CLOSED happens exactly once (atomic swap)
//!    and is never reversed; a key gets a new `Connection` instead.
//! 3. **Synchronous Notification**: The close observer runs inside the
//!    transition, before listeners hear about it.
//!
//! ## Structure Overview
//!
//! ```text
//! Connection
//!   ├── writer: tokio Mutex<Option<OwnedWriteHalf>>
//!   ├── listeners: Vec<(id, UnboundedSender<ConnectionEvent>)>
//!   ├── observer: Option<CloseObserver>     (registry self-eviction)
//!   └── reader task ── read_buf ──> Data | Closed | Error
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use tgw_common::{ConnectionKey, GatewayError, GatewayResult};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Why a connection left the OPEN state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer finished its side of the stream.
    PeerClosed,
    /// A read or write failed.
    Error(GatewayError),
    /// Destroyed locally (timeout, release, shutdown).
    Destroyed,
}

/// Event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Data(Bytes),
    Closed,
    Error(GatewayError),
}

/// Callback invoked once when the connection closes.
pub(crate) type CloseObserver = Box<dyn FnOnce(&Connection, &CloseReason) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: Vec<(u64, UnboundedSender<ConnectionEvent>)>,
}

/// A live TCP connection owned by the registry and shared with commands.
pub struct Connection {
    id: u64,
    key: ConnectionKey,
    peer_addr: Option<SocketAddr>,
    open: AtomicBool,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    listeners: Mutex<Listeners>,
    observer: Mutex<Option<CloseObserver>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Dials `key` and returns the connection plus its unstarted read half.
    pub(crate) async fn connect(
        key: &ConnectionKey,
        id: u64,
        connect_timeout: Duration,
    ) -> GatewayResult<(Connection, OwnedReadHalf)> {
        let attempt = TcpStream::connect((key.host(), key.port()));
        let stream = match tokio::time::timeout(connect_timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(GatewayError::connect(key, &err)),
            Err(_) => {
                let err = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {} ms", connect_timeout.as_millis()),
                );
                return Err(GatewayError::connect(key, &err));
            }
        };
        // Small request/response payloads; don't let Nagle hold them back.
        stream
            .set_nodelay(true)
            .map_err(|err| GatewayError::connect(key, &err))?;

        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let connection = Connection {
            id,
            key: key.clone(),
            peer_addr,
            open: AtomicBool::new(true),
            writer: AsyncMutex::new(Some(write_half)),
            listeners: Mutex::new(Listeners::default()),
            observer: Mutex::new(None),
            reader: Mutex::new(None),
        };
        Ok((connection, read_half))
    }

    /// Installs the close observer and spawns the reader task.
    pub(crate) fn start(self: &Arc<Self>, read_half: OwnedReadHalf, observer: CloseObserver) {
        *self.observer.lock() = Some(observer);
        let handle = tokio::spawn(read_loop(Arc::downgrade(self), read_half));
        *self.reader.lock() = Some(handle);
    }

    /// Process-unique id; a reconnect for the same key gets a new one.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    /// Number of listeners currently attached.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().senders.len()
    }

    /// Attaches a listener that receives every event from now on.
    ///
    /// On a closed connection the subscription yields nothing.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        // Checked under the listener lock so a concurrent close can't miss us.
        if self.is_open() {
            listeners.senders.push((id, tx));
        }
        Subscription {
            id,
            rx,
            connection: Arc::clone(self),
        }
    }

    /// Writes all bytes and flushes.
    ///
    /// A write failure closes the connection with `CloseReason::Error`.
    pub async fn write(&self, bytes: &[u8]) -> GatewayResult<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(GatewayError::Transport {
                message: format!("connection to {} is closed", self.key),
                code: "ENOTCONN".to_string(),
            });
        };

        let result = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            let err = GatewayError::transport(&err);
            guard.take();
            drop(guard);
            self.transition(CloseReason::Error(err.clone()), true);
            return Err(err);
        }
        trace!(key = %self.key, conn_id = self.id, bytes = bytes.len(), "wrote payload");
        Ok(())
    }

    /// Forcibly closes the connection. Idempotent.
    pub fn destroy(&self) {
        self.transition(CloseReason::Destroyed, true);
    }

    /// OPEN -> CLOSED. Returns false if the connection was already closed.
    ///
    /// `stop_reader` is false only on the reader task, which returns by itself.
    fn transition(&self, reason: CloseReason, stop_reader: bool) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(key = %self.key, conn_id = self.id, reason = ?reason, "connection closed");

        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer(self, &reason);
        }

        // A write in progress keeps its half until it finishes; the drop closes it.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        // Stopping the reader drops the read half without waiting on the peer.
        if stop_reader {
            if let Some(handle) = self.reader.lock().take() {
                handle.abort();
            }
        }

        let event = match reason {
            CloseReason::Error(err) => ConnectionEvent::Error(err),
            CloseReason::PeerClosed | CloseReason::Destroyed => ConnectionEvent::Closed,
        };
        let senders = std::mem::take(&mut self.listeners.lock().senders);
        for (_, tx) in senders {
            let _ = tx.send(event.clone());
        }
        true
    }

    fn emit(&self, event: ConnectionEvent) {
        let mut listeners = self.listeners.lock();
        listeners
            .senders
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().senders.retain(|(sid, _)| *sid != id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn read_loop(connection: Weak<Connection>, mut reader: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let result = reader.read_buf(&mut buf).await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match result {
            Ok(0) => {
                connection.transition(CloseReason::PeerClosed, false);
                return;
            }
            Ok(n) => {
                trace!(key = %connection.key, conn_id = connection.id, bytes = n, "received chunk");
                connection.emit(ConnectionEvent::Data(buf.split().freeze()));
            }
            Err(err) => {
                connection.transition(CloseReason::Error(GatewayError::transport(&err)), false);
                return;
            }
        }
    }
}

/// Listener registration; dropping it detaches the listener.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<ConnectionEvent>,
    connection: Arc<Connection>,
}

impl Subscription {
    /// Next event, or `None` once the connection has closed and the final
    /// event was consumed.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.unsubscribe(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("conn_id", &self.connection.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn started_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = ConnectionKey::new("127.0.0.1", u32::from(addr.port())).unwrap();
        let (connection, read_half) = Connection::connect(&key, 1, Duration::from_secs(1))
            .await
            .unwrap();
        let connection = Arc::new(connection);
        connection.start(read_half, Box::new(|_: &Connection, _: &CloseReason| {}));
        let (peer, _) = listener.accept().await.unwrap();
        (connection, peer)
    }

    #[tokio::test]
    async fn error_close_releases_socket_without_peer_activity() {
        let (connection, mut peer) = started_pair().await;

        let err = GatewayError::transport(&io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(connection.transition(CloseReason::Error(err), true));
        assert_eq!(connection.state(), ConnectionState::Closed);

        // The reader was stopped rather than left parked on a silent peer.
        assert!(connection.reader.lock().is_none());
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0))));
    }

    #[tokio::test]
    async fn close_notifies_listeners_once() {
        let (connection, _peer) = started_pair().await;
        let mut subscription = connection.subscribe();
        assert_eq!(connection.listener_count(), 1);

        connection.destroy();
        connection.destroy();

        assert_eq!(subscription.recv().await, Some(ConnectionEvent::Closed));
        assert_eq!(subscription.recv().await, None);
        assert_eq!(connection.listener_count(), 0);
    }
}
