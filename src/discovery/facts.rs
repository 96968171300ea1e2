//! Discovery fact types and the pure derivations over raw resources

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::api::ResourceItem;

/// Smallest disk offered as an install target.
pub const MIN_DISK_BYTES: u64 = 3 * 1024 * 1024 * 1024;

/// Resolvers used when a node reports none and the caller gives no fallback.
pub const DEFAULT_RESOLVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];

const EXCLUDED_DISK_PREFIXES: &[&str] = &["loop", "ram", "zd", "drbd", "sr"];
const DROPPED_LINKS: &[&str] = &["lo", "docker0"];
const DROPPED_LINK_PREFIXES: &[&str] = &["br-", "veth", "cali"];
const PHYSICAL_LINK_PREFIXES: &[&str] = &["eno", "eth", "enp", "enx", "ens", "bond"];
const ZERO_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub total_mib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    pub vendor: String,
    pub product: String,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub dev_path: String,
    pub size_bytes: u64,
    pub model: String,
    pub transport: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac: String,
    pub ips: Vec<String>,
    pub operational_state: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub link: String,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dest: String,
    pub gateway: String,
    pub link: String,
    pub metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    pub link: String,
    pub gateway: String,
}

/// Everything discovery knows about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFacts {
    pub hostname: String,
    pub memory: Option<Memory>,
    pub processors: Vec<Processor>,
    pub disks: Vec<Disk>,
    pub interfaces: Vec<Interface>,
    pub addresses: Vec<Address>,
    pub routes: Vec<Route>,
    pub default_route: Option<DefaultRoute>,
    pub resolvers: Vec<String>,
}

impl NodeFacts {
    /// MAC of the default link, or of the first interface.
    pub fn primary_mac(&self) -> Option<&str> {
        let by_default = self.default_route.as_ref().and_then(|route| {
            self.interfaces
                .iter()
                .find(|i| i.name == route.link)
                .map(|i| i.mac.as_str())
        });
        by_default
            .or_else(|| self.interfaces.first().map(|i| i.mac.as_str()))
            .filter(|mac| !mac.is_empty() && *mac != ZERO_MAC)
    }
}

// ============================================================================
// SBIO: Pure derivations (no I/O)
// ============================================================================

fn str_field<'a>(spec: &'a Value, key: &str) -> &'a str {
    spec.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn u64_field(spec: &Value, key: &str) -> u64 {
    spec.get(key).and_then(Value::as_u64).unwrap_or_default()
}

/// Saturates instead of wrapping for values past `u32::MAX`.
fn u32_field(spec: &Value, key: &str) -> u32 {
    u32::try_from(u64_field(spec, key)).unwrap_or(u32::MAX)
}

fn bool_field(spec: &Value, key: &str) -> bool {
    spec.get(key).and_then(Value::as_bool).unwrap_or_default()
}

pub fn hostname_of(items: &[ResourceItem]) -> Option<String> {
    items
        .iter()
        .map(|item| str_field(&item.spec, "hostname"))
        .find(|h| !h.is_empty())
        .map(str::to_string)
}

/// Total installed memory; module sizes are reported in MiB.
pub fn memory_of(items: &[ResourceItem]) -> Memory {
    Memory {
        total_mib: items.iter().map(|item| u64_field(&item.spec, "size")).sum(),
    }
}

pub fn processors_of(items: &[ResourceItem]) -> Vec<Processor> {
    items
        .iter()
        .map(|item| Processor {
            vendor: str_field(&item.spec, "manufacturer").to_string(),
            product: str_field(&item.spec, "productName").to_string(),
            threads: u32_field(&item.spec, "threadCount"),
        })
        .collect()
}

/// Physical disks large enough to install onto, ordered by device path.
pub fn eligible_disks(items: &[ResourceItem]) -> Vec<Disk> {
    let mut disks: Vec<Disk> = items
        .iter()
        .filter(|item| {
            !EXCLUDED_DISK_PREFIXES.iter().any(|p| item.id.starts_with(p))
                && !bool_field(&item.spec, "cdrom")
                && !bool_field(&item.spec, "readonly")
                && u64_field(&item.spec, "size") >= MIN_DISK_BYTES
        })
        .map(|item| {
            let dev_path = match str_field(&item.spec, "dev_path") {
                "" => format!("/dev/{}", item.id),
                path => path.to_string(),
            };
            Disk {
                id: item.id.clone(),
                dev_path,
                size_bytes: u64_field(&item.spec, "size"),
                model: str_field(&item.spec, "model").to_string(),
                transport: str_field(&item.spec, "transport").to_string(),
            }
        })
        .collect();
    disks.sort_by(|a, b| a.dev_path.cmp(&b.dev_path));
    disks
}

pub fn addresses_of(items: &[ResourceItem]) -> Vec<Address> {
    items
        .iter()
        .filter_map(|item| {
            let cidr = str_field(&item.spec, "address");
            if cidr.is_empty() {
                return None;
            }
            Some(Address {
                link: str_field(&item.spec, "linkName").to_string(),
                cidr: cidr.to_string(),
            })
        })
        .collect()
}

/// Routes; an empty IPv4 destination is the default route.
pub fn routes_of(items: &[ResourceItem]) -> Vec<Route> {
    items
        .iter()
        .map(|item| {
            let family = str_field(&item.spec, "family");
            let dest = match str_field(&item.spec, "dst") {
                "" if family == "inet6" => "::/0".to_string(),
                "" => "0.0.0.0/0".to_string(),
                dst => dst.to_string(),
            };
            Route {
                dest,
                gateway: str_field(&item.spec, "gateway").to_string(),
                link: str_field(&item.spec, "outLinkName").to_string(),
                metric: u32_field(&item.spec, "priority"),
            }
        })
        .collect()
}

pub fn resolvers_of(items: &[ResourceItem]) -> Vec<String> {
    items
        .iter()
        .flat_map(|item| {
            item.spec
                .get("dnsServers")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// The IPv4 default route with the lowest metric, ties broken by link name.
///
/// Only routes leaving through one of `interfaces` count; a route over a
/// dropped link such as `br-*` never becomes the default.
pub fn default_route(routes: &[Route], interfaces: &[Interface]) -> Option<DefaultRoute> {
    routes
        .iter()
        .filter(|r| r.dest == "0.0.0.0/0" && interfaces.iter().any(|i| i.name == r.link))
        .min_by(|a, b| a.metric.cmp(&b.metric).then_with(|| a.link.cmp(&b.link)))
        .map(|r| DefaultRoute {
            link: r.link.clone(),
            gateway: r.gateway.clone(),
        })
}

/// Addresses on `link`, IPv4 first, otherwise in reported order.
pub fn addresses_on_link(addresses: &[Address], link: &str) -> Vec<String> {
    let mut on_link: Vec<&Address> = addresses.iter().filter(|a| a.link == link).collect();
    on_link.sort_by_key(|a| !is_ipv4_cidr(&a.cidr));
    on_link.into_iter().map(|a| a.cidr.clone()).collect()
}

/// Node resolvers, or the fallback list when the node has none.
pub fn resolvers_or(reported: Vec<String>, fallback: &[String]) -> Vec<String> {
    if !reported.is_empty() {
        return reported;
    }
    if !fallback.is_empty() {
        return fallback.to_vec();
    }
    DEFAULT_RESOLVERS.iter().map(|s| s.to_string()).collect()
}

fn is_ipv4_cidr(cidr: &str) -> bool {
    match cidr.parse::<IpNet>() {
        Ok(net) => matches!(net, IpNet::V4(_)),
        Err(_) => matches!(cidr.parse::<IpAddr>(), Ok(IpAddr::V4(_))),
    }
}

/// Whether a link is presented to templates and the wizard.
pub fn is_presentable_link(name: &str, mac: &str) -> bool {
    if DROPPED_LINKS.contains(&name) || DROPPED_LINK_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    if mac.eq_ignore_ascii_case(ZERO_MAC) {
        return false;
    }
    PHYSICAL_LINK_PREFIXES.iter().any(|p| name.starts_with(p)) || !mac.is_empty()
}

/// Filter links down to operator-relevant interfaces and attach their IPs.
///
/// Interfaces carrying an IPv4 address sort first, then by name.
pub fn interfaces_of(links: &[ResourceItem], addresses: &[Address]) -> Vec<Interface> {
    let mut interfaces: Vec<Interface> = links
        .iter()
        .filter_map(|item| {
            let mac = str_field(&item.spec, "hardwareAddr");
            if !is_presentable_link(&item.id, mac) {
                return None;
            }
            Some(Interface {
                name: item.id.clone(),
                mac: mac.to_string(),
                ips: addresses_on_link(addresses, &item.id),
                operational_state: str_field(&item.spec, "operationalState").to_string(),
                kind: str_field(&item.spec, "kind").to_string(),
            })
        })
        .collect();
    interfaces.sort_by(|a, b| {
        let a_v4 = a.ips.iter().any(|ip| is_ipv4_cidr(ip));
        let b_v4 = b.ips.iter().any(|ip| is_ipv4_cidr(ip));
        b_v4.cmp(&a_v4).then_with(|| a.name.cmp(&b.name))
    });
    interfaces
}
