use super::remote::{FederationIdentity, RemoteQueue, RemoteQueueManager};
use super::{normalize, LocalQueueManager, Queue};
use crate::federation::{ConnectionPool, NetworkAddress};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Where a queue name resolved to.
pub enum ResolvedQueue {
    Local(Arc<Queue>),
    Remote(RemoteQueue),
}

/// Facade over the local manager and all remote managers.
///
/// Resolution is local-first, then across remote managers; the first match
/// wins, so an operator can shadow a remote queue with a local one without
/// renaming anything.
pub struct QueueRegistry {
    local: Arc<LocalQueueManager>,
    remotes: DashMap<String, Arc<RemoteQueueManager>>,
    pool: Arc<ConnectionPool>,
    socket_timeout: Duration,
    identity: FederationIdentity,
}

impl QueueRegistry {
    pub fn new(
        local: Arc<LocalQueueManager>,
        pool: Arc<ConnectionPool>,
        socket_timeout: Duration,
        identity: FederationIdentity,
    ) -> Self {
        Self {
            local,
            remotes: DashMap::new(),
            pool,
            socket_timeout,
            identity,
        }
    }

    pub fn local(&self) -> &Arc<LocalQueueManager> {
        &self.local
    }

    pub fn resolve(&self, name: &str) -> Option<ResolvedQueue> {
        let name = normalize(name);
        if let Some(queue) = self.local.get_queue(&name) {
            return Some(ResolvedQueue::Local(queue));
        }
        for entry in self.remotes.iter() {
            if let Some(proxy) = entry.value().get_queue(&name) {
                return Some(ResolvedQueue::Remote(proxy));
            }
        }
        None
    }

    /// Apply a peer's activation notice: create or refresh its remote
    /// manager with the advertised name list.
    pub fn update_peer(&self, address: NetworkAddress, names: Vec<String>) {
        let key = address.to_string();
        let manager = self
            .remotes
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RemoteQueueManager::new(
                    address.clone(),
                    Arc::clone(&self.pool),
                    self.socket_timeout,
                    self.identity.clone(),
                ))
            })
            .clone();
        manager.update_names(names);
        info!(peer = %address, "updated remote queue manager");
    }

    /// Apply a peer's deactivation notice: its queues stop resolving.
    pub fn remove_peer(&self, address: &NetworkAddress) {
        if self.remotes.remove(&address.to_string()).is_some() {
            info!(peer = %address, "removed remote queue manager");
        }
    }

    pub fn remote_manager(&self, address: &NetworkAddress) -> Option<Arc<RemoteQueueManager>> {
        self.remotes
            .get(&address.to_string())
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Disposition;

    fn registry() -> QueueRegistry {
        let local = Arc::new(LocalQueueManager::new(
            tempfile::tempdir().expect("tempdir").keep(),
            "SYSTEM.DEAD.QUEUE",
            Duration::from_millis(5),
        ));
        QueueRegistry::new(
            local,
            Arc::new(ConnectionPool::new(Duration::from_millis(100))),
            Duration::from_millis(100),
            FederationIdentity {
                user: "system".to_string(),
                credential: String::new(),
            },
        )
    }

    #[test]
    fn local_queue_shadows_remote_with_same_name() {
        let registry = registry();
        let peer = NetworkAddress::new("peer-a", 4590).unwrap();
        registry.update_peer(peer, vec!["APPQ".to_string()]);
        registry
            .local()
            .define_queue("APPQ", 4, Disposition::Temporary)
            .unwrap();

        match registry.resolve("APPQ") {
            Some(ResolvedQueue::Local(queue)) => assert_eq!(queue.name(), "APPQ"),
            _ => panic!("expected local resolution"),
        }
    }

    #[test]
    fn remote_resolution_after_advertisement() {
        let registry = registry();
        let peer = NetworkAddress::new("peer-a", 4590).unwrap();
        registry.update_peer(peer.clone(), vec!["Q1".to_string()]);

        match registry.resolve("q1") {
            Some(ResolvedQueue::Remote(proxy)) => {
                assert_eq!(proxy.name(), "Q1");
                assert_eq!(proxy.address(), &peer);
            }
            _ => panic!("expected remote resolution"),
        }
    }

    #[test]
    fn deactivated_peer_stops_resolving() {
        let registry = registry();
        let peer = NetworkAddress::new("peer-a", 4590).unwrap();
        registry.update_peer(peer.clone(), vec!["Q1".to_string()]);
        registry.remove_peer(&peer);
        assert!(registry.resolve("Q1").is_none());
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = registry();
        assert!(registry.resolve("NOWHERE").is_none());
    }
}
