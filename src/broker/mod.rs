//! Broker core: TCP accept loop, per-connection session handlers, and the
//! request-processor dispatch surface.

pub mod processor;
pub mod server;
pub mod session;

pub use processor::{ProcessorRegistry, RequestProcessor};
pub use server::BrokerServer;
pub use session::{Session, SessionHandler};
