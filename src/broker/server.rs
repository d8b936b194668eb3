use super::processor::ProcessorRegistry;
use super::session::{Session, SessionHandler};
use crate::auth::{SecurityStore, StaticSecurityStore};
use crate::config::BrokerConfig;
use crate::federation::{ConnectionPool, NetworkAddress, Notifier};
use crate::housekeeper;
use crate::queue::{FederationIdentity, LocalQueueManager, QueueRegistry};
use crate::{RelayError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The broker engine: owns the accept loop, the live-session map, the queue
/// registry, the outbound pool, and the housekeeper.
///
/// Every collaborator is constructed here (or injected for tests) and passed
/// by handle — no global lookups anywhere in the core.
pub struct BrokerServer {
    config: BrokerConfig,
    registry: Arc<QueueRegistry>,
    processors: Arc<ProcessorRegistry>,
    pool: Arc<ConnectionPool>,
    notifier: Arc<Notifier>,
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BrokerServer {
    /// Build a broker with the config-driven security store.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let security = Arc::new(StaticSecurityStore::new(
            &config.users,
            config.allow_anonymous,
        ));
        Self::with_security_store(config, security)
    }

    /// Build a broker around a caller-supplied security store.
    pub fn with_security_store(
        config: BrokerConfig,
        security: Arc<dyn SecurityStore>,
    ) -> Result<Self> {
        config.validate().map_err(RelayError::Config)?;

        let socket_timeout = Duration::from_millis(config.socket_timeout_ms);
        let pool = Arc::new(ConnectionPool::new(Duration::from_millis(
            config.connect_timeout_ms,
        )));
        let local = Arc::new(LocalQueueManager::new(
            &config.repository_dir,
            &config.dead_queue_name,
            Duration::from_millis(config.get_poll_interval_ms),
        ));
        let identity = FederationIdentity {
            user: config.federation_user.clone(),
            credential: config.federation_credential.clone(),
        };
        let registry = Arc::new(QueueRegistry::new(
            local,
            Arc::clone(&pool),
            socket_timeout,
            identity,
        ));
        let processors = Arc::new(ProcessorRegistry::standard(Arc::clone(&registry), security));

        let peers = config
            .peers
            .iter()
            .map(|p| p.parse::<NetworkAddress>())
            .collect::<Result<Vec<_>>>()?;
        let notifier = Arc::new(Notifier::new(peers, Arc::clone(&pool), socket_timeout));

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            registry,
            processors,
            pool,
            notifier,
            sessions: Arc::new(DashMap::new()),
            shutdown_tx,
        })
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Request a graceful stop. Ordering matters: handlers see their stop
    /// flag before their connections are severed, then the accept loop and
    /// housekeeper get the broadcast. Safe to call more than once.
    pub fn shutdown(&self) {
        info!("initiating broker shutdown");
        for entry in self.sessions.iter() {
            entry.value().stop();
        }
        self.pool.shutdown_all();
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0 first).
    pub async fn run_on(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        self.activate(local_addr.port()).await?;
        info!(addr = %local_addr, "broker listening");

        let socket_timeout = Duration::from_millis(self.config.socket_timeout_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut consecutive_errors = 0u32;

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        consecutive_errors = 0;
                        let session = Arc::new(Session::new(peer));
                        let handler = SessionHandler::new(
                            stream,
                            session,
                            Arc::clone(&self.processors),
                            Arc::clone(&self.sessions),
                            socket_timeout,
                        );
                        tokio::spawn(handler.run());
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        error!(
                            consecutive_errors,
                            "failed to accept connection: {}", e
                        );
                        if consecutive_errors >= self.config.max_accept_errors {
                            break Err(RelayError::Network(format!(
                                "{} consecutive accept failures, shutting down",
                                consecutive_errors
                            )));
                        }
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("accept loop received shutdown signal");
                    break Ok(());
                }
            }
        };

        // Repeated accept failures are fatal to the whole broker: tear down
        // the same way a requested shutdown would.
        if result.is_err() {
            self.shutdown();
        }
        self.deactivate(local_addr.port()).await;
        info!("broker stopped");
        result
    }

    /// Startup sequence: restore persisted queues, predefine configured
    /// ones, start the housekeeper, then advertise to peers.
    async fn activate(&self, port: u16) -> Result<()> {
        let local = self.registry.local();
        local.activate()?;
        for predefined in &self.config.predefined_queues {
            local.define_queue(
                &predefined.name,
                predefined.threshold,
                predefined.disposition,
            )?;
        }

        housekeeper::spawn(
            Arc::clone(local),
            Duration::from_millis(self.config.housekeeper_interval_ms),
            self.shutdown_tx.subscribe(),
        );

        self.notifier
            .broadcast_state(true, &self.config.host, port, local.queue_names())
            .await;
        Ok(())
    }

    /// Shutdown sequence: tell peers this broker is gone, then persist
    /// every PERMANENT queue.
    async fn deactivate(&self, port: u16) {
        self.notifier
            .broadcast_state(false, &self.config.host, port, Vec::new())
            .await;
        if let Err(e) = self.registry.local().deactivate() {
            warn!("failed to persist queues during shutdown: {}", e);
        }
    }
}
