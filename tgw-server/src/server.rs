//! # Gateway Server
//!
//! Accept JSON-lines connections, validate requests, and dispatch them to
//! the connection pool, one reply line per request line.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tgw_common::{
    parse_request, CommandOptions, ConnectionKey, GatewayError, GatewayReply, GatewayRequest,
    GatewayResult,
};
use tgw_pool::{execute, ConnectionRegistry};

use crate::lanes::Lanes;
use crate::metrics::Metrics;

/// Longest accepted request line, newline excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// The gateway facade: owns the registry and serializes commands per key.
#[derive(Debug)]
pub struct Gateway {
    registry: ConnectionRegistry,
    lanes: Lanes,
    metrics: Metrics,
}

impl Gateway {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Gateway {
            registry,
            lanes: Lanes::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs one command for `key`, waiting for earlier commands on the same key.
    pub async fn send(
        &self,
        key: &ConnectionKey,
        payload: &[u8],
        options: &CommandOptions,
    ) -> GatewayResult<String> {
        let _lane = self.lanes.enter(key).await;
        let connection = self.registry.acquire(key).await?;
        execute(&connection, payload, options).await
    }

    /// Handles one request line and builds its reply.
    pub async fn dispatch(&self, line: &[u8]) -> GatewayReply {
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "rejected request");
                return GatewayReply::failed(&err);
            }
        };

        match request {
            GatewayRequest::Send(send) => {
                let (key, payload, options) = match send.into_command() {
                    Ok(command) => command,
                    Err(err) => return GatewayReply::failed(&err),
                };
                self.metrics.record_request_start();
                let started = Instant::now();
                let result = self.send(&key, &payload, &options).await;
                self.metrics.record_request_end(started.elapsed());
                match result {
                    Ok(response) => GatewayReply::sent(&key, response),
                    Err(err) => {
                        self.metrics.record_error();
                        GatewayReply::failed_for(&key, &err)
                    }
                }
            }
            GatewayRequest::Connections => GatewayReply::connections(self.registry.list_keys()),
            GatewayRequest::Close(target) => match target.key() {
                Ok(key) => GatewayReply::closed(self.registry.release(&key)),
                Err(err) => GatewayReply::failed(&err),
            },
            GatewayRequest::Health => GatewayReply::health(self.registry.count()),
            GatewayRequest::Stats => {
                let stats = serde_json::to_value(self.metrics.snapshot())
                    .unwrap_or(serde_json::Value::Null);
                GatewayReply::stats(stats)
            }
        }
    }

    /// Destroys every pooled connection.
    pub fn shutdown(&self) {
        self.registry.release_all();
    }
}

/// Handles a single client connection.
pub async fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) -> io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            let line = match next_line(&mut buffer) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    stream.write_all(&GatewayReply::failed(&err).to_line()).await?;
                    return Ok(());
                }
            };
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            let reply = gateway.dispatch(line).await;
            stream.write_all(&reply.to_line()).await?;
        }
    }

    Ok(())
}

/// Splits the next complete line off `buffer`.
///
/// Fails once a line, complete or still arriving, exceeds `MAX_LINE_LEN`.
fn next_line(buffer: &mut BytesMut) -> GatewayResult<Option<BytesMut>> {
    match buffer.iter().position(|&b| b == b'\n') {
        Some(end) if end > MAX_LINE_LEN => Err(oversized_line()),
        Some(end) => {
            let line = buffer.split_to(end);
            buffer.advance(1);
            Ok(Some(line))
        }
        None if buffer.len() > MAX_LINE_LEN => Err(oversized_line()),
        None => Ok(None),
    }
}

fn oversized_line() -> GatewayError {
    GatewayError::validation(format!("request line exceeds {} bytes", MAX_LINE_LEN))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    &line[start..]
}

/// Accepts clients until `shutdown` resolves, then releases every pooled
/// connection and stops the client handlers.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    tokio::pin!(shutdown);
    let mut clients = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "client connected");
                let gateway = Arc::clone(&gateway);
                clients.spawn(async move {
                    if let Err(err) = handle_connection(stream, gateway).await {
                        debug!(%peer, error = %err, "client connection ended with error");
                    }
                });
            }
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }

    info!("shutting down gateway");
    gateway.shutdown();
    clients.shutdown().await;
    Ok(())
}
