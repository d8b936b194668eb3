use super::NetworkAddress;
use crate::protocol::{DecodedFrame, Frame, FrameCodec};
use crate::{RelayError, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One outbound broker-to-broker connection, owned by the pool.
///
/// The framed transport sits behind an async mutex so concurrent sessions
/// forwarding to the same peer serialize their request/reply exchanges.
pub struct PooledConnection {
    peer: NetworkAddress,
    framed: tokio::sync::Mutex<Framed<TcpStream, FrameCodec>>,
}

/// Registry of outbound connections keyed by a generated identifier.
///
/// The pool is the single authority for outbound connection identity:
/// every dial goes through `allocate`, and released identifiers are closed
/// and never reused.
pub struct ConnectionPool {
    connections: DashMap<Uuid, Arc<PooledConnection>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_timeout,
        }
    }

    /// Dial the peer and register the connection under a fresh identifier.
    /// A failed dial registers nothing.
    pub async fn allocate(&self, peer: &NetworkAddress) -> Result<Uuid> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((peer.host(), peer.port())),
        )
        .await
        .map_err(|_| RelayError::Federation(format!("connect to {} timed out", peer)))?
        .map_err(|e| RelayError::Federation(format!("connect to {} failed: {}", peer, e)))?;

        let id = Uuid::new_v4();
        let connection = Arc::new(PooledConnection {
            peer: peer.clone(),
            framed: tokio::sync::Mutex::new(Framed::new(stream, FrameCodec)),
        });
        self.connections.insert(id, connection);
        debug!(%id, %peer, "allocated outbound connection");
        Ok(id)
    }

    /// One request/reply exchange on a pooled connection, bounded by
    /// `reply_timeout`.
    pub async fn call(&self, id: Uuid, frame: Frame, reply_timeout: Duration) -> Result<Frame> {
        let connection = self
            .connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::Federation(format!("unknown connection {}", id)))?;

        let mut framed = connection.framed.lock().await;
        framed
            .send(frame)
            .await
            .map_err(|e| RelayError::Federation(format!("send to {} failed: {}", connection.peer, e)))?;

        match timeout(reply_timeout, framed.next()).await {
            Ok(Some(Ok(DecodedFrame::Frame(reply)))) => Ok(reply),
            Ok(Some(Ok(DecodedFrame::Invalid(e)))) | Ok(Some(Err(e))) => {
                Err(RelayError::Federation(format!(
                    "bad reply from {}: {}",
                    connection.peer, e
                )))
            }
            Ok(None) => Err(RelayError::Federation(format!(
                "connection to {} closed mid-exchange",
                connection.peer
            ))),
            Err(_) => Err(RelayError::Federation(format!(
                "reply from {} timed out",
                connection.peer
            ))),
        }
    }

    /// Close and forget. Dropping the framed transport closes the socket.
    pub fn release(&self, id: Uuid) {
        if self.connections.remove(&id).is_some() {
            debug!(%id, "released outbound connection");
        }
    }

    /// Close and clear everything. Safe to call repeatedly.
    pub fn shutdown_all(&self) {
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(count, "closed all outbound connections");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.connections.is_empty() {
            warn!(
                remaining = self.connections.len(),
                "connection pool dropped with live connections"
            );
        }
    }
}
