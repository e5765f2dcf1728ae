//! Listener settings

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings consumed by [`crate::GatewayServer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub address: IpAddr,
    /// Bind port (0 picks an ephemeral port)
    pub port: u16,
    /// How long in-flight requests and streams may run after shutdown is
    /// requested before they are closed
    pub grace_period_secs: u64,
    /// Size of the blocking worker pool for request/response applications
    pub blocking_workers: usize,
    /// Largest request body handed to a request/response application
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            grace_period_secs: 10,
            blocking_workers: 16,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerSettings {
    /// Settings bound to an ephemeral loopback port
    pub fn loopback() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
