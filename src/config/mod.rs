pub mod settings;

use crate::queue::Disposition;
use serde::{Deserialize, Serialize};

/// A queue created at broker startup, before any client DEFINE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredefinedQueue {
    pub name: String,
    pub threshold: usize,
    pub disposition: Disposition,
}

/// Credentials accepted by the static security store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub user: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Root directory; queue snapshots live under `<repository_dir>/repo/`.
    pub repository_dir: String,
    /// Per-socket read timeout; a timed-out read re-enters the session loop.
    pub socket_timeout_ms: u64,
    /// Consecutive accept failures tolerated before the broker shuts down.
    pub max_accept_errors: u32,
    pub housekeeper_interval_ms: u64,
    pub dead_queue_name: String,
    /// Poll granularity for GET against an empty queue.
    pub get_poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub predefined_queues: Vec<PredefinedQueue>,
    /// Peer brokers, as "host:port" strings.
    pub peers: Vec<String>,
    pub users: Vec<UserCredential>,
    pub allow_anonymous: bool,
    /// Identity presented to peers when forwarding operations.
    pub federation_user: String,
    pub federation_credential: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4590,
            repository_dir: "./repository".to_string(),
            socket_timeout_ms: 500,
            max_accept_errors: 5,
            housekeeper_interval_ms: 30_000,
            dead_queue_name: "SYSTEM.DEAD.QUEUE".to_string(),
            get_poll_interval_ms: 50,
            connect_timeout_ms: 5_000,
            predefined_queues: Vec::new(),
            peers: Vec::new(),
            users: Vec::new(),
            allow_anonymous: true, // open access for development setups
            federation_user: "system".to_string(),
            federation_credential: String::new(),
        }
    }
}

impl BrokerConfig {
    /// Validate configuration bounds before the broker starts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.port == 0 {
            return Err("port must be in 1..=65535".to_string());
        }
        if self.socket_timeout_ms == 0 {
            return Err("socket_timeout_ms must be > 0".to_string());
        }
        if self.max_accept_errors == 0 {
            return Err("max_accept_errors must be > 0".to_string());
        }
        if self.housekeeper_interval_ms == 0 {
            return Err("housekeeper_interval_ms must be > 0".to_string());
        }
        if self.get_poll_interval_ms == 0 {
            return Err("get_poll_interval_ms must be > 0".to_string());
        }
        if !crate::queue::valid_name(&crate::queue::normalize(&self.dead_queue_name)) {
            return Err(format!(
                "invalid dead_queue_name '{}'",
                self.dead_queue_name
            ));
        }
        for queue in &self.predefined_queues {
            if !crate::queue::valid_name(&crate::queue::normalize(&queue.name)) {
                return Err(format!("invalid predefined queue name '{}'", queue.name));
            }
            if queue.threshold == 0 {
                return Err(format!(
                    "predefined queue '{}' must have threshold > 0",
                    queue.name
                ));
            }
        }
        Ok(())
    }
}
