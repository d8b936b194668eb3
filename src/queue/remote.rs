use super::{normalize, QueueStatus};
use crate::federation::{ConnectionPool, NetworkAddress};
use crate::protocol::{
    ConnectRequest, ErrorCode, Frame, GetRequest, PutRequest, QueryRequest, QueueMessage, Reply,
    Request,
};
use crate::{RelayError, Result};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Identity the proxy presents to a peer before forwarding operations.
#[derive(Debug, Clone)]
pub struct FederationIdentity {
    pub user: String,
    pub credential: String,
}

/// Proxy for one peer broker's advertised queues.
///
/// Owns no message state: only the set of names the peer advertised in its
/// last system-state notification, and the plumbing to forward operations.
pub struct RemoteQueueManager {
    address: NetworkAddress,
    names: RwLock<HashSet<String>>,
    pool: Arc<ConnectionPool>,
    socket_timeout: Duration,
    identity: FederationIdentity,
}

impl RemoteQueueManager {
    pub fn new(
        address: NetworkAddress,
        pool: Arc<ConnectionPool>,
        socket_timeout: Duration,
        identity: FederationIdentity,
    ) -> Self {
        Self {
            address,
            names: RwLock::new(HashSet::new()),
            pool,
            socket_timeout,
            identity,
        }
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    /// Replace the advertised name set wholesale with the peer's latest list.
    pub fn update_names(&self, names: Vec<String>) {
        let normalized: HashSet<String> = names.iter().map(|n| normalize(n)).collect();
        debug!(peer = %self.address, count = normalized.len(), "updated advertised queue names");
        *self.names.write() = normalized;
    }

    pub fn advertised_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// A proxy handle for `name`, if the peer advertised it.
    pub fn get_queue(&self, name: &str) -> Option<RemoteQueue> {
        let name = normalize(name);
        if !self.names.read().contains(&name) {
            return None;
        }
        Some(RemoteQueue {
            name,
            address: self.address.clone(),
            pool: Arc::clone(&self.pool),
            socket_timeout: self.socket_timeout,
            identity: self.identity.clone(),
        })
    }
}

/// A local handle standing in for a queue that lives on a peer broker.
/// PUT/GET/QUERY are forwarded frame-for-frame over a pooled connection.
pub struct RemoteQueue {
    name: String,
    address: NetworkAddress,
    pool: Arc<ConnectionPool>,
    socket_timeout: Duration,
    identity: FederationIdentity,
}

impl RemoteQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    pub async fn put(&self, message: QueueMessage) -> Result<()> {
        let reply = self
            .exchange(
                Request::Put(PutRequest {
                    queue: self.name.clone(),
                    message,
                }),
                self.socket_timeout,
            )
            .await?;
        match reply {
            Reply::Ok => Ok(()),
            Reply::Error(e) => Err(self.map_error(e.code, e.reason)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Forward a GET. A zero timeout is clamped to the socket bound rather
    /// than letting a dead peer hang the calling session forever.
    pub async fn get(&self, timeout_ms: u64) -> Result<Option<QueueMessage>> {
        let effective_ms = if timeout_ms == 0 {
            self.socket_timeout.as_millis() as u64
        } else {
            timeout_ms
        };
        let reply_timeout = Duration::from_millis(effective_ms) + self.socket_timeout;
        let reply = self
            .exchange(
                Request::Get(GetRequest {
                    queue: self.name.clone(),
                    timeout_ms: effective_ms,
                }),
                reply_timeout,
            )
            .await?;
        match reply {
            Reply::Message(m) => Ok(Some(m.message)),
            Reply::Error(e) if e.code == ErrorCode::NoMessage => Ok(None),
            Reply::Error(e) => Err(self.map_error(e.code, e.reason)),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn query(&self) -> Result<QueueStatus> {
        let reply = self
            .exchange(
                Request::Query(QueryRequest {
                    queue: self.name.clone(),
                }),
                self.socket_timeout,
            )
            .await?;
        match reply {
            Reply::QueueInfo(info) => Ok(QueueStatus {
                name: info.name,
                depth: info.depth as usize,
                threshold: info.threshold as usize,
                disposition: info.disposition,
            }),
            Reply::Error(e) => Err(self.map_error(e.code, e.reason)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Allocate a pooled connection, authenticate, run one exchange, and
    /// release. Released connections are closed, never reused by identity.
    async fn exchange(&self, request: Request, reply_timeout: Duration) -> Result<Reply> {
        let id = self.pool.allocate(&self.address).await?;
        let result = self.run_exchange(id, request, reply_timeout).await;
        self.pool.release(id);
        result
    }

    async fn run_exchange(
        &self,
        id: Uuid,
        request: Request,
        reply_timeout: Duration,
    ) -> Result<Reply> {
        let connect = Request::Connect(ConnectRequest {
            user: self.identity.user.clone(),
            credential: self.identity.credential.clone(),
        });
        match self
            .pool
            .call(id, Frame::Request(connect), self.socket_timeout)
            .await?
        {
            Frame::Reply(Reply::Ok) => {}
            Frame::Reply(Reply::Error(e)) => {
                return Err(RelayError::Remote(format!(
                    "peer {} refused federation identity: {}",
                    self.address, e.reason
                )))
            }
            other => return Err(self.unexpected_frame(other)),
        }

        match self
            .pool
            .call(id, Frame::Request(request), reply_timeout)
            .await?
        {
            Frame::Reply(reply) => Ok(reply),
            other => Err(self.unexpected_frame(other)),
        }
    }

    /// Map a peer's error reply onto the local taxonomy so callers see
    /// queue-full or unknown-queue regardless of where the queue lives.
    fn map_error(&self, code: ErrorCode, reason: String) -> RelayError {
        match code {
            ErrorCode::QueueFull => RelayError::QueueFull(self.name.clone()),
            ErrorCode::UnknownQueue => RelayError::UnknownQueue(self.name.clone()),
            _ => RelayError::Remote(format!("peer {}: {}", self.address, reason)),
        }
    }

    fn unexpected(&self, reply: Reply) -> RelayError {
        RelayError::Remote(format!(
            "unexpected reply from {} for queue {}: {:?}",
            self.address, self.name, reply
        ))
    }

    fn unexpected_frame(&self, frame: Frame) -> RelayError {
        RelayError::Remote(format!(
            "unexpected frame from {}: {:?}",
            self.address, frame
        ))
    }
}
