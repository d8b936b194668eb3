use super::{ConnectionPool, NetworkAddress};
use crate::protocol::{Frame, Reply, Request, SystemStateRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Sends system-state notifications to the configured peer brokers.
///
/// On activation the notification carries the local queue-name list; on
/// deactivation it carries none. This is the only channel peers ever learn
/// queue names from. A peer that cannot be reached is logged and skipped —
/// federation failures never block local operation or the other peers.
pub struct Notifier {
    peers: Vec<NetworkAddress>,
    pool: Arc<ConnectionPool>,
    reply_timeout: Duration,
}

impl Notifier {
    pub fn new(
        peers: Vec<NetworkAddress>,
        pool: Arc<ConnectionPool>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            pool,
            reply_timeout,
        }
    }

    pub fn peers(&self) -> &[NetworkAddress] {
        &self.peers
    }

    /// Notify every configured peer of this broker's state, one at a time.
    pub async fn broadcast_state(
        &self,
        activated: bool,
        local_host: &str,
        local_port: u16,
        queue_names: Vec<String>,
    ) {
        for peer in &self.peers {
            let request = SystemStateRequest {
                activated,
                host: local_host.to_string(),
                port: local_port,
                queue_names: queue_names.clone(),
            };
            match self.notify_peer(peer, request).await {
                Ok(()) => info!(%peer, activated, "notified peer of system state"),
                Err(e) => warn!(%peer, activated, "failed to notify peer: {}", e),
            }
        }
    }

    async fn notify_peer(
        &self,
        peer: &NetworkAddress,
        request: SystemStateRequest,
    ) -> crate::Result<()> {
        let id = self.pool.allocate(peer).await?;
        let result = self
            .pool
            .call(
                id,
                Frame::Request(Request::SystemState(request)),
                self.reply_timeout,
            )
            .await;
        self.pool.release(id);

        match result? {
            Frame::Reply(Reply::Ok) => Ok(()),
            Frame::Reply(Reply::Error(e)) => Err(crate::RelayError::Federation(format!(
                "peer {} rejected notification: {}",
                peer, e.reason
            ))),
            other => Err(crate::RelayError::Federation(format!(
                "unexpected reply from {}: {:?}",
                peer, other
            ))),
        }
    }
}
