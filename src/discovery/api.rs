//! Node admin API seam
//!
//! Discovery reads typed resources from a node. The transport sits behind
//! [`NodeApi`] so renders can run against `talosctl`, captured inventories,
//! or nothing at all (offline).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DiscoveryError;

/// Resource types read from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Hostname,
    MemoryModules,
    Processors,
    Disks,
    Links,
    Addresses,
    Routes,
    Resolvers,
}

impl ResourceKind {
    /// Resource type name understood by `talosctl get`.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Hostname => "hostname",
            Self::MemoryModules => "memorymodules",
            Self::Processors => "processors",
            Self::Disks => "disks",
            Self::Links => "links",
            Self::Addresses => "addresses",
            Self::Routes => "routes",
            Self::Resolvers => "resolvers",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One resource instance: its ID and raw spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceItem {
    pub id: String,
    pub spec: Value,
}

impl ResourceItem {
    pub fn new(id: impl Into<String>, spec: Value) -> Self {
        Self { id: id.into(), spec }
    }
}

/// Transport for reading node resources.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// List every instance of `kind` on `node`.
    async fn list(&self, node: &str, kind: ResourceKind) -> Result<Vec<ResourceItem>, DiscoveryError>;
}

/// Offline capability: every read fails and nothing touches the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineNodeApi;

#[async_trait]
impl NodeApi for OfflineNodeApi {
    async fn list(&self, _node: &str, kind: ResourceKind) -> Result<Vec<ResourceItem>, DiscoveryError> {
        Err(DiscoveryError::OfflineFactRequired {
            resource: kind.to_string(),
        })
    }
}

/// In-memory resources keyed by node, for captured inventories and tests.
#[derive(Debug, Default)]
pub struct StaticNodeApi {
    resources: HashMap<(String, ResourceKind), Result<Vec<ResourceItem>, DiscoveryError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticNodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(
        mut self,
        node: impl Into<String>,
        kind: ResourceKind,
        items: Vec<ResourceItem>,
    ) -> Self {
        self.resources.insert((node.into(), kind), Ok(items));
        self
    }

    pub fn with_failure(mut self, node: impl Into<String>, kind: ResourceKind, error: DiscoveryError) -> Self {
        self.resources.insert((node.into(), kind), Err(error));
        self
    }

    /// Delay every answer, to exercise deadlines.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `list` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeApi for StaticNodeApi {
    async fn list(&self, node: &str, kind: ResourceKind) -> Result<Vec<ResourceItem>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.resources.get(&(node.to_string(), kind)) {
            Some(result) => result.clone(),
            None => Err(DiscoveryError::Unavailable {
                resource: kind.to_string(),
                reason: format!("node {node} has no {kind} resource"),
            }),
        }
    }
}
