//! Broker-to-broker plumbing: the outbound connection pool and the
//! system-state notifier peers learn queue names from.

pub mod notifier;
pub mod pool;

pub use notifier::Notifier;
pub use pool::ConnectionPool;

use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated host/port pair. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    host: String,
    port: u16,
}

impl NetworkAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if port == 0 {
            return Err(RelayError::Config(format!(
                "invalid port {} for host '{}'",
                port, host
            )));
        }
        if host.is_empty()
            || !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
        {
            return Err(RelayError::Config(format!("invalid host '{}'", host)));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NetworkAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::Config(format!("peer address '{}' is not host:port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| RelayError::Config(format!("invalid port in peer address '{}'", s)))?;
        NetworkAddress::new(host, port)
    }
}
