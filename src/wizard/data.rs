//! Everything the wizard collects before generating

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::presets::{ValuesPatch, DEFAULT_PRESET};
use crate::render::DEFAULT_TALOS_VERSION;
use crate::scanner::NodeInfo;

use super::WizardError;

/// Whether the wizard creates a project or adds a node to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitMode {
    #[default]
    NewCluster,
    AddNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    ControlPlane,
    #[default]
    Worker,
}

impl NodeRole {
    /// Chart template rendered for this role.
    pub fn template(self) -> &'static str {
        match self {
            Self::ControlPlane => "templates/controlplane.yaml",
            Self::Worker => "templates/worker.yaml",
        }
    }
}

/// Per-node settings, written as the node's overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the workstation reaches the node at.
    pub ip: String,
    pub role: NodeRole,
    pub hostname: String,
    pub install_disk: String,
    pub interface: String,
    /// CIDRs assigned to `interface`.
    pub addresses: Vec<String>,
    pub gateway: Option<String>,
    pub nameservers: Vec<String>,
}

impl NodeConfig {
    pub fn new(ip: impl Into<String>, role: NodeRole) -> Self {
        Self {
            ip: ip.into(),
            role,
            ..Default::default()
        }
    }

    /// Prefill from scanned facts.
    pub fn from_node(node: &NodeInfo, role: NodeRole) -> Self {
        let facts = &node.facts;
        // The default route only counts when it leaves through a presented interface.
        let default_route = facts
            .default_route
            .as_ref()
            .filter(|route| facts.interfaces.iter().any(|i| i.name == route.link));
        let interface = default_route
            .map(|route| route.link.clone())
            .or_else(|| facts.interfaces.first().map(|i| i.name.clone()))
            .unwrap_or_default();
        let addresses = facts
            .interfaces
            .iter()
            .find(|i| i.name == interface)
            .map(|i| i.ips.clone())
            .unwrap_or_default();
        Self {
            ip: node.ip.to_string(),
            role,
            hostname: facts.hostname.clone(),
            install_disk: facts.disks.first().map(|d| d.dev_path.clone()).unwrap_or_default(),
            interface,
            addresses,
            gateway: default_route.map(|r| r.gateway.clone()),
            nameservers: facts.resolvers.clone(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_install_disk(mut self, disk: impl Into<String>) -> Self {
        self.install_disk = disk.into();
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>, addresses: Vec<String>) -> Self {
        self.interface = interface.into();
        self.addresses = addresses;
        self
    }

    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn validate(&self) -> Result<(), WizardError> {
        let invalid = |reason: String| Err(WizardError::Validation(reason));
        if self.ip.parse::<IpAddr>().is_err() {
            return invalid(format!("node address '{}' is not an IP address", self.ip));
        }
        for (field, value) in [
            ("hostname", &self.hostname),
            ("install disk", &self.install_disk),
            ("interface", &self.interface),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("node {}: {field} is required", self.ip));
            }
        }
        if let Some(bad) = self.addresses.iter().find(|a| a.parse::<IpNet>().is_err()) {
            return invalid(format!("node {}: address '{bad}' is not a CIDR", self.ip));
        }
        if let Some(gateway) = &self.gateway {
            if gateway.parse::<IpAddr>().is_err() {
                return invalid(format!("node {}: gateway '{gateway}' is not an IP address", self.ip));
            }
        }
        Ok(())
    }
}

/// Accumulated answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitData {
    pub root: PathBuf,
    pub mode: InitMode,
    pub preset: String,
    pub cluster_name: String,
    pub talos_version: String,
    /// Overwrite existing project files. Node files are never overwritten.
    pub force: bool,
    /// Written into the preset's `values.yaml`.
    pub values: ValuesPatch,
    pub scan_cidr: Option<String>,
    pub discovered: Vec<NodeInfo>,
    pub node: Option<NodeConfig>,
    pub now: DateTime<Utc>,
}

impl InitData {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mode: InitMode::NewCluster,
            preset: DEFAULT_PRESET.to_string(),
            cluster_name: String::new(),
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            force: false,
            values: ValuesPatch::default(),
            scan_cidr: None,
            discovered: Vec::new(),
            node: None,
            now: Utc::now(),
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.values.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_talos_version(mut self, version: impl Into<String>) -> Self {
        self.talos_version = version.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_mode(mut self, mode: InitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// The cluster name, or the root directory's name when none was given.
    pub fn effective_cluster_name(&self) -> String {
        if !self.cluster_name.is_empty() {
            return self.cluster_name.clone();
        }
        self.root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "talos".to_string())
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Overlay written for a node: install disk, hostname, nameservers and its
/// primary interface (with the floating IP as VIP on control-plane nodes).
pub fn node_overlay(node: &NodeConfig, floating_ip: Option<&str>) -> Value {
    let mut interface = Map::new();
    interface.insert("interface".into(), json!(node.interface));
    if node.addresses.is_empty() {
        interface.insert("dhcp".into(), json!(true));
    } else {
        interface.insert("addresses".into(), json!(node.addresses));
    }
    if let Some(gateway) = &node.gateway {
        interface.insert("routes".into(), json!([{"network": "0.0.0.0/0", "gateway": gateway}]));
    }
    if let Some(vip) = floating_ip.filter(|ip| !ip.is_empty()) {
        if node.role == NodeRole::ControlPlane {
            interface.insert("vip".into(), json!({"ip": vip}));
        }
    }

    let mut network = Map::new();
    network.insert("hostname".into(), json!(node.hostname));
    if !node.nameservers.is_empty() {
        network.insert("nameservers".into(), json!(node.nameservers));
    }
    network.insert("interfaces".into(), Value::Array(vec![Value::Object(interface)]));

    json!({
        "machine": {
            "type": match node.role {
                NodeRole::ControlPlane => "controlplane",
                NodeRole::Worker => "worker",
            },
            "install": {"disk": node.install_disk},
            "network": network,
        }
    })
}
