//! # relaymq
//!
//! relaymq is a point-to-point message-queue broker. Clients connect over
//! TCP, authenticate, and issue PUT/GET/QUERY operations against named
//! queues; brokers additionally federate with configured peers so that a
//! peer's queues resolve transparently through the local registry.
//!
//! ## Architecture
//!
//! - [`protocol`] - frame header, payload codec, and message types
//! - [`queue`] - local queue manager, remote proxies, and the registry facade
//! - [`broker`] - TCP accept loop, session handlers, request processors
//! - [`federation`] - outbound connection pool and peer state notifier
//! - [`housekeeper`] - periodic message-expiry task
//! - [`auth`] - security store consumed by the connect processor
//! - [`config`] - broker configuration
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use relaymq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> relaymq::Result<()> {
//!     let config = BrokerConfig {
//!         port: 4590,
//!         repository_dir: "./repository".to_string(),
//!         ..Default::default()
//!     };
//!     let server = BrokerServer::new(config)?;
//!     server.run().await
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod federation;
pub mod housekeeper;
pub mod protocol;
pub mod queue;

pub use auth::{SecurityStore, StaticSecurityStore};
pub use broker::{BrokerServer, ProcessorRegistry, RequestProcessor, Session};
pub use config::{BrokerConfig, PredefinedQueue};
pub use federation::{ConnectionPool, NetworkAddress, Notifier};
pub use protocol::{DecodedFrame, ErrorCode, Frame, FrameCodec, QueueMessage, Reply, Request};
pub use queue::{Disposition, LocalQueueManager, Queue, QueueRegistry, QueueStatus};

use thiserror::Error;

/// relaymq error types.
///
/// One variant per failure class from the broker's error taxonomy: protocol
/// faults abort the offending frame only, capacity faults surface as failed
/// replies, connectivity faults end the affected session, persistence faults
/// degrade to an empty queue, and federation faults are contained per peer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// File I/O and snapshot persistence failures
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Frame/payload encoding and decoding failures
    #[error("codec error: {0}")]
    Codec(#[from] protocol::FrameCodecError),

    /// Configuration validation and parsing errors
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization errors from the config layer
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// PUT against a queue already at its threshold
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Operation against a queue name no manager resolves
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Authentication failure or operation on an unauthenticated session
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Failure notifying or dialing a peer broker
    #[error("federation error: {0}")]
    Federation(String),

    /// Error reported by a peer broker for a forwarded operation
    #[error("remote error: {0}")]
    Remote(String),

    /// General protocol processing errors
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection-level failures outside the codec
    #[error("network error: {0}")]
    Network(String),
}

/// Result type alias used throughout relaymq.
pub type Result<T> = std::result::Result<T, RelayError>;
