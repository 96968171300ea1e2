//! Reachability probe for the Talos API port

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Port of the Talos machine API.
pub const TALOS_API_PORT: u16 = 50000;

/// Deadline of one probe.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// Decides whether a host answers on the Talos API port.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: IpAddr, deadline: Duration) -> bool;
}

/// Plain TCP connect.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    port: u16,
}

impl Default for TcpProber {
    fn default() -> Self {
        Self { port: TALOS_API_PORT }
    }
}

impl TcpProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: IpAddr, deadline: Duration) -> bool {
        let addr = SocketAddr::new(ip, self.port);
        match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "probe refused");
                false
            }
            Err(_) => {
                debug!(%addr, "probe timed out");
                false
            }
        }
    }
}
