//! Lazily-populated, per-node discovery client

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::{NodeApi, ResourceItem, ResourceKind};
use super::facts::{self, Address, DefaultRoute, Disk, Interface, Memory, NodeFacts, Processor, Route};
use super::DiscoveryError;

/// Per-request deadline for one resource read.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Fact names templates can ask for.
pub const FACT_NAMES: &[&str] = &[
    "hostname",
    "memory",
    "processors",
    "disks",
    "interfaces",
    "addresses",
    "routes",
    "default_route",
    "default_addresses_by_gateway",
    "default_link_name_by_gateway",
    "default_resolvers",
    "system_disk_name",
];

type CachedResult = Result<Arc<Vec<ResourceItem>>, DiscoveryError>;

/// Reads facts about one node on demand.
///
/// Each resource is requested at most once; successes and failures are both
/// memoized for the lifetime of the client.
pub struct DiscoveryClient {
    node: String,
    api: Arc<dyn NodeApi>,
    cancel: CancellationToken,
    deadline: Duration,
    cache: DashMap<ResourceKind, CachedResult>,
}

impl DiscoveryClient {
    pub fn new(node: impl Into<String>, api: Arc<dyn NodeApi>, cancel: CancellationToken) -> Self {
        Self {
            node: node.into(),
            api,
            cancel,
            deadline: DEFAULT_DEADLINE,
            cache: DashMap::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    async fn fetch(&self, kind: ResourceKind) -> CachedResult {
        if let Some(hit) = self.cache.get(&kind).map(|entry| entry.value().clone()) {
            return hit;
        }
        let result = self.fetch_uncached(kind).await;
        self.cache.insert(kind, result.clone());
        result
    }

    async fn fetch_uncached(&self, kind: ResourceKind) -> CachedResult {
        let resource = kind.to_string();
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled { resource });
        }
        debug!(node = %self.node, %resource, "reading resource");

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DiscoveryError::Cancelled { resource }),
            outcome = tokio::time::timeout(self.deadline, self.api.list(&self.node, kind)) => {
                match outcome {
                    Ok(Ok(items)) => Ok(Arc::new(items)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(DiscoveryError::Timeout { resource }),
                }
            }
        }
    }

    pub async fn hostname(&self) -> Result<String, DiscoveryError> {
        let items = self.fetch(ResourceKind::Hostname).await?;
        facts::hostname_of(&items).ok_or_else(|| DiscoveryError::Unavailable {
            resource: "hostname".to_string(),
            reason: "node reported no hostname".to_string(),
        })
    }

    pub async fn memory(&self) -> Result<Memory, DiscoveryError> {
        let items = self.fetch(ResourceKind::MemoryModules).await?;
        Ok(facts::memory_of(&items))
    }

    pub async fn processors(&self) -> Result<Vec<Processor>, DiscoveryError> {
        let items = self.fetch(ResourceKind::Processors).await?;
        Ok(facts::processors_of(&items))
    }

    pub async fn disks(&self) -> Result<Vec<Disk>, DiscoveryError> {
        let items = self.fetch(ResourceKind::Disks).await?;
        Ok(facts::eligible_disks(&items))
    }

    pub async fn addresses(&self) -> Result<Vec<Address>, DiscoveryError> {
        let items = self.fetch(ResourceKind::Addresses).await?;
        Ok(facts::addresses_of(&items))
    }

    pub async fn interfaces(&self) -> Result<Vec<Interface>, DiscoveryError> {
        let links = self.fetch(ResourceKind::Links).await?;
        let addresses = self.addresses().await?;
        Ok(facts::interfaces_of(&links, &addresses))
    }

    pub async fn routes(&self) -> Result<Vec<Route>, DiscoveryError> {
        let items = self.fetch(ResourceKind::Routes).await?;
        Ok(facts::routes_of(&items))
    }

    /// Default route over a presented interface; see [`facts::default_route`].
    pub async fn default_route(&self) -> Result<Option<DefaultRoute>, DiscoveryError> {
        let routes = self.routes().await?;
        let interfaces = self.interfaces().await?;
        Ok(facts::default_route(&routes, &interfaces))
    }

    pub async fn default_link_name_by_gateway(&self) -> Result<Option<String>, DiscoveryError> {
        Ok(self.default_route().await?.map(|route| route.link))
    }

    /// Addresses on the default link, IPv4 first. Empty without a default link.
    pub async fn default_addresses_by_gateway(&self) -> Result<Vec<String>, DiscoveryError> {
        match self.default_link_name_by_gateway().await? {
            Some(link) => Ok(facts::addresses_on_link(&self.addresses().await?, &link)),
            None => Ok(Vec::new()),
        }
    }

    pub async fn default_resolvers(&self, fallback: &[String]) -> Result<Vec<String>, DiscoveryError> {
        let items = self.fetch(ResourceKind::Resolvers).await?;
        Ok(facts::resolvers_or(facts::resolvers_of(&items), fallback))
    }

    /// Device path of the first eligible install disk.
    pub async fn system_disk_name(&self) -> Result<String, DiscoveryError> {
        self.disks()
            .await?
            .into_iter()
            .next()
            .map(|disk| disk.dev_path)
            .ok_or_else(|| DiscoveryError::Unavailable {
                resource: "disks".to_string(),
                reason: "no eligible install disk".to_string(),
            })
    }

    /// Everything at once. Memory, processors and resolvers are optional and
    /// are dropped with a warning when the node cannot provide them.
    pub async fn facts(&self) -> Result<NodeFacts, DiscoveryError> {
        let (hostname, disks, interfaces, addresses, routes) = futures::try_join!(
            self.hostname(),
            self.disks(),
            self.interfaces(),
            self.addresses(),
            self.routes(),
        )?;

        let memory = downgrade(&self.node, self.memory().await)?;
        let processors = downgrade(&self.node, self.processors().await)?.unwrap_or_default();
        let resolvers = downgrade(&self.node, self.default_resolvers(&[]).await)?
            .unwrap_or_else(|| facts::resolvers_or(Vec::new(), &[]));

        let default_route = facts::default_route(&routes, &interfaces);
        Ok(NodeFacts {
            hostname,
            memory,
            processors,
            disks,
            interfaces,
            addresses,
            default_route,
            routes,
            resolvers,
        })
    }

    /// A fact by template name, as JSON. `fallback` only feeds
    /// `default_resolvers`.
    pub async fn fact_value(&self, name: &str, fallback: &[String]) -> Result<Value, DiscoveryError> {
        match name {
            "hostname" => to_json(self.hostname().await?),
            "memory" => to_json(self.memory().await?),
            "processors" => to_json(self.processors().await?),
            "disks" => to_json(self.disks().await?),
            "interfaces" => to_json(self.interfaces().await?),
            "addresses" => to_json(self.addresses().await?),
            "routes" => to_json(self.routes().await?),
            "default_route" => to_json(self.default_route().await?),
            "default_addresses_by_gateway" => to_json(self.default_addresses_by_gateway().await?),
            "default_link_name_by_gateway" => to_json(self.default_link_name_by_gateway().await?),
            "default_resolvers" => to_json(self.default_resolvers(fallback).await?),
            "system_disk_name" => to_json(self.system_disk_name().await?),
            other => Err(DiscoveryError::Unavailable {
                resource: other.to_string(),
                reason: "unknown fact".to_string(),
            }),
        }
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, DiscoveryError> {
    serde_json::to_value(value).map_err(|e| DiscoveryError::Unavailable {
        resource: "fact".to_string(),
        reason: e.to_string(),
    })
}

fn downgrade<T>(node: &str, result: Result<T, DiscoveryError>) -> Result<Option<T>, DiscoveryError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ (DiscoveryError::Unavailable { .. } | DiscoveryError::Timeout { .. })) => {
            warn!(node, error = %e, "optional fact unavailable, continuing without it");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Synchronous access to facts for template helpers.
pub trait FactSource: Send + Sync {
    fn fact(&self, name: &str, fallback: &[String]) -> Result<Value, DiscoveryError>;
}

/// Bridges the synchronous engine to an async [`DiscoveryClient`].
///
/// Must be used from a blocking worker (`spawn_blocking`), never from
/// inside an async task.
pub struct BlockingFacts {
    client: Arc<DiscoveryClient>,
    handle: Handle,
}

impl BlockingFacts {
    pub fn new(client: Arc<DiscoveryClient>, handle: Handle) -> Self {
        Self { client, handle }
    }
}

impl FactSource for BlockingFacts {
    fn fact(&self, name: &str, fallback: &[String]) -> Result<Value, DiscoveryError> {
        self.handle.block_on(self.client.fact_value(name, fallback))
    }
}

/// Fact source for renders without a target node.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundFacts;

impl FactSource for UnboundFacts {
    fn fact(&self, name: &str, _fallback: &[String]) -> Result<Value, DiscoveryError> {
        Err(DiscoveryError::Unavailable {
            resource: name.to_string(),
            reason: "no target node selected".to_string(),
        })
    }
}
