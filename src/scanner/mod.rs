//! Network scanner
//!
//! Finds Talos nodes in a CIDR range: every host is probed on the Talos API
//! port by a bounded set of workers; hosts that answer are identified by
//! their hostname and described through [`DiscoveryClient::facts`].

mod probe;

pub use probe::{Prober, TcpProber, PROBE_DEADLINE, TALOS_API_PORT};

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::{DiscoveryClient, DiscoveryError, NodeApi, NodeFacts};
use crate::error::{Classify, ErrorKind};
use crate::observe::{silent, ObserverHandle};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_TARGET_COUNT: usize = 3;
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Narrowest prefixes accepted, so a scan stays within 65536 hosts.
pub const MIN_PREFIX_V4: u8 = 16;
pub const MIN_PREFIX_V6: u8 = 112;

const FLOW: &str = "scan";

/// Errors from a scan. Interrupted scans carry the nodes fully processed so far.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("range {cidr} is too large: prefix must be at least /{min}")]
    RangeTooLarge { cidr: String, min: u8 },

    #[error("scan timed out after {}s with {} node(s) found", .after.as_secs(), .partial.len())]
    Timeout {
        after: Duration,
        partial: Vec<NodeInfo>,
    },

    #[error("scan cancelled with {} node(s) found", .partial.len())]
    Cancelled { partial: Vec<NodeInfo> },
}

impl ScanError {
    /// Nodes found before the scan was interrupted.
    pub fn partial(&self) -> &[NodeInfo] {
        match self {
            Self::Timeout { partial, .. } | Self::Cancelled { partial } => partial,
            _ => &[],
        }
    }
}

impl Classify for ScanError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCidr { .. } | Self::RangeTooLarge { .. } => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// A node found by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: IpAddr,
    pub hostname: String,
    pub mac: Option<String>,
    pub facts: NodeFacts,
}

impl NodeInfo {
    pub fn new(ip: IpAddr, facts: NodeFacts) -> Self {
        Self {
            ip,
            hostname: facts.hostname.clone(),
            mac: facts.primary_mac().map(str::to_string),
            facts,
        }
    }

    /// Identity used for de-duplication: the MAC, or the IP without one.
    pub fn identity(&self) -> String {
        self.mac
            .clone()
            .unwrap_or_else(|| self.ip.to_string())
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Hosts of a scan range. A bare address scans just that host.
pub fn hosts_of(cidr: &str) -> Result<Vec<IpAddr>, ScanError> {
    let trimmed = cidr.trim();
    let net = match trimmed.parse::<IpNet>() {
        Ok(net) => net,
        Err(e) => match trimmed.parse::<IpAddr>() {
            Ok(ip) => IpNet::from(ip),
            Err(_) => {
                return Err(ScanError::InvalidCidr {
                    cidr: cidr.to_string(),
                    reason: e.to_string(),
                })
            }
        },
    };
    let min = match net {
        IpNet::V4(_) => MIN_PREFIX_V4,
        IpNet::V6(_) => MIN_PREFIX_V6,
    };
    if net.prefix_len() < min {
        return Err(ScanError::RangeTooLarge {
            cidr: cidr.to_string(),
            min,
        });
    }
    Ok(net.hosts().collect())
}

/// Nodes kept in discovery order, unique by identity.
#[derive(Default)]
struct Found {
    nodes: Vec<NodeInfo>,
    seen: HashSet<String>,
}

impl Found {
    fn insert(&mut self, node: NodeInfo) {
        if self.seen.insert(node.identity()) {
            self.nodes.push(node);
        } else {
            debug!(ip = %node.ip, "duplicate node skipped");
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn into_sorted(mut self) -> Vec<NodeInfo> {
        self.nodes.sort_by(|a, b| a.ip.cmp(&b.ip));
        self.nodes
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Scans ranges for Talos nodes.
pub struct Scanner {
    api: Arc<dyn NodeApi>,
    prober: Arc<dyn Prober>,
    workers: usize,
    target_count: usize,
    probe_deadline: Duration,
    scan_timeout: Duration,
    cancel: CancellationToken,
    observer: ObserverHandle,
}

impl Scanner {
    /// `api` reads facts from hosts that answer the probe.
    pub fn new(api: Arc<dyn NodeApi>) -> Self {
        Self {
            api,
            prober: Arc::new(TcpProber::new()),
            workers: DEFAULT_WORKERS,
            target_count: DEFAULT_TARGET_COUNT,
            probe_deadline: PROBE_DEADLINE,
            scan_timeout: SCAN_TIMEOUT,
            cancel: CancellationToken::new(),
            observer: silent(),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, DEFAULT_WORKERS);
        self
    }

    /// Stop after this many nodes; `0` scans the whole range.
    pub fn with_target_count(mut self, count: usize) -> Self {
        self.target_count = count;
        self
    }

    pub fn with_probe_deadline(mut self, deadline: Duration) -> Self {
        self.probe_deadline = deadline;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    /// Scan `cidr`. Progress (0 to 100, never decreasing) goes to
    /// `progress` when given; a full channel drops the update.
    pub async fn scan(
        &self,
        cidr: &str,
        progress: Option<&mpsc::Sender<u8>>,
    ) -> Result<Vec<NodeInfo>, ScanError> {
        let hosts = hosts_of(cidr)?;
        let total = hosts.len().max(1);
        info!(%cidr, hosts = hosts.len(), workers = self.workers, "scanning");
        self.observer.step(FLOW, cidr);

        let report = |percent: u8| {
            if let Some(tx) = progress {
                let _ = tx.try_send(percent);
            }
            self.observer.progress(FLOW, percent);
        };
        report(0);

        let probes = futures::stream::iter(hosts)
            .map(|ip| self.probe_host(ip))
            .buffer_unordered(self.workers);
        tokio::pin!(probes);
        let deadline = tokio::time::sleep(self.scan_timeout);
        tokio::pin!(deadline);

        let mut found = Found::default();
        let mut done = 0usize;
        let mut last = 0u8;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(found = found.len(), "scan cancelled");
                    self.observer.finished(FLOW, false);
                    return Err(ScanError::Cancelled { partial: found.into_sorted() });
                }
                _ = &mut deadline => {
                    info!(found = found.len(), "scan timed out");
                    self.observer.finished(FLOW, false);
                    return Err(ScanError::Timeout {
                        after: self.scan_timeout,
                        partial: found.into_sorted(),
                    });
                }
                next = probes.next() => {
                    let Some((ip, outcome)) = next else {
                        break;
                    };
                    done += 1;
                    match outcome {
                        Ok(Some(node)) => {
                            debug!(%ip, hostname = %node.hostname, "node found");
                            found.insert(node);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(%ip, error = %e, "skipping host");
                            self.observer.degraded(FLOW, &ip.to_string(), &e.to_string());
                        }
                    }
                    let percent = (done * 100 / total).min(100) as u8;
                    if percent > last {
                        last = percent;
                        report(percent);
                    }
                    if self.target_count > 0 && found.len() >= self.target_count {
                        debug!(target = self.target_count, "target node count reached");
                        break;
                    }
                }
            }
        }

        if last < 100 {
            report(100);
        }
        info!(found = found.len(), "scan finished");
        self.observer.finished(FLOW, true);
        Ok(found.into_sorted())
    }

    async fn probe_host(&self, ip: IpAddr) -> (IpAddr, Result<Option<NodeInfo>, DiscoveryError>) {
        if !self.prober.probe(ip, self.probe_deadline).await {
            return (ip, Ok(None));
        }
        let client = DiscoveryClient::new(ip.to_string(), self.api.clone(), self.cancel.child_token());
        let result = async {
            client.hostname().await?;
            let facts = client.facts().await?;
            Ok(Some(NodeInfo::new(ip, facts)))
        }
        .await;
        (ip, result)
    }
}
