//! Rendered output checks
//!
//! Rendered text is split into YAML documents, each re-parsed. Machine
//! configurations (`version: v1alpha1`) are held to a subset of the Talos
//! schema; every other document needs `apiVersion` and `kind`.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use serde_json::Value;

const MACHINE_CONFIG_KEYS: &[&str] = &["version", "debug", "persist", "machine", "cluster"];
const MACHINE_TYPES: &[&str] = &["controlplane", "worker"];

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Split on `---` separator lines, dropping documents that are blank.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            documents.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    documents.push(current);
    documents
        .into_iter()
        .filter(|doc| doc.lines().any(|l| !l.trim().is_empty()))
        .collect()
}

/// Re-parse one document. `None` for documents holding only comments.
pub fn parse_document(text: &str) -> Result<Option<Value>, String> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    Ok((!value.is_null()).then_some(value))
}

pub fn is_machine_config(doc: &Value) -> bool {
    doc.get("version").and_then(Value::as_str) == Some("v1alpha1")
}

/// Check a parsed document. `with_overlay` adds the per-node requirements.
pub fn check_document(doc: &Value, with_overlay: bool) -> Result<(), String> {
    let Value::Object(map) = doc else {
        return Err("document is not a mapping".to_string());
    };
    if !is_machine_config(doc) {
        for key in ["apiVersion", "kind"] {
            if map.get(key).and_then(Value::as_str).map_or(true, str::is_empty) {
                return Err(format!("document without '{key}'"));
            }
        }
        return Ok(());
    }

    if let Some(unknown) = map.keys().find(|k| !MACHINE_CONFIG_KEYS.contains(&k.as_str())) {
        return Err(format!("unknown top-level key '{unknown}'"));
    }

    let machine = doc.get("machine").unwrap_or(&Value::Null);
    if !machine.is_object() {
        return Err("'machine' must be a mapping".to_string());
    }
    let machine_type = machine.get("type").and_then(Value::as_str).unwrap_or_default();
    if !MACHINE_TYPES.contains(&machine_type) {
        return Err(format!(
            "machine.type must be one of {}, got '{machine_type}'",
            MACHINE_TYPES.join(", ")
        ));
    }

    let interfaces = machine
        .pointer("/network/interfaces")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (i, interface) in interfaces.iter().enumerate() {
        check_interface(interface).map_err(|e| format!("machine.network.interfaces[{i}]: {e}"))?;
    }

    for pointer in ["/network/podSubnets", "/network/serviceSubnets"] {
        if let Some(subnets) = doc.get("cluster").and_then(|c| c.pointer(pointer)) {
            check_cidr_list(subnets, false).map_err(|e| format!("cluster{}: {e}", dotted(pointer)))?;
        }
    }
    if let Some(subnets) = machine.pointer("/kubelet/nodeIP/validSubnets") {
        check_cidr_list(subnets, true).map_err(|e| format!("machine.kubelet.nodeIP.validSubnets: {e}"))?;
    }

    if let Some(endpoint) = doc.pointer("/cluster/controlPlane/endpoint") {
        let endpoint = endpoint.as_str().unwrap_or_default();
        if !is_https_endpoint(endpoint) {
            return Err(format!(
                "cluster.controlPlane.endpoint must be an https://host:port URL, got '{endpoint}'"
            ));
        }
    }

    if with_overlay {
        for (path, pointer) in [
            ("machine.install.disk", "/install/disk"),
            ("machine.network.hostname", "/network/hostname"),
        ] {
            if machine.pointer(pointer).and_then(Value::as_str).map_or(true, str::is_empty) {
                return Err(format!("{path} is required for a node"));
            }
        }
        if interfaces.is_empty() {
            return Err("at least one entry in machine.network.interfaces is required for a node".to_string());
        }
    }
    Ok(())
}

fn dotted(pointer: &str) -> String {
    pointer.replace('/', ".")
}

fn check_interface(interface: &Value) -> Result<(), String> {
    if interface.get("interface").is_none() && interface.get("deviceSelector").is_none() {
        return Err("needs 'interface' or 'deviceSelector'".to_string());
    }
    if let Some(addresses) = interface.get("addresses") {
        check_cidr_list(addresses, false).map_err(|e| format!("addresses: {e}"))?;
    }
    if let Some(routes) = interface.get("routes").and_then(Value::as_array) {
        for route in routes {
            if let Some(network) = route.get("network").and_then(Value::as_str) {
                network
                    .parse::<IpNet>()
                    .map_err(|_| format!("route network '{network}' is not a CIDR"))?;
            }
        }
    }
    if let Some(ip) = interface.pointer("/vip/ip").and_then(Value::as_str) {
        ip.parse::<IpAddr>()
            .map_err(|_| format!("vip.ip '{ip}' is not an IP address"))?;
    }
    Ok(())
}

/// A list of CIDRs. `negatable` accepts a leading `!` (kubelet subnet
/// exclusions). Bare addresses are accepted where Talos allows them.
fn check_cidr_list(value: &Value, negatable: bool) -> Result<(), String> {
    let items = value.as_array().ok_or_else(|| "expected a list".to_string())?;
    for item in items {
        let text = item.as_str().ok_or_else(|| format!("{item} is not a string"))?;
        let text = if negatable { text.trim_start_matches('!') } else { text };
        if text.parse::<IpNet>().is_err() && text.parse::<IpAddr>().is_err() {
            return Err(format!("'{text}' is not a CIDR"));
        }
    }
    Ok(())
}

pub fn is_https_endpoint(endpoint: &str) -> bool {
    let Ok(pattern) = Regex::new(r"^https://(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9.\-]+):(\d{1,5})/?$") else {
        return false;
    };
    pattern
        .captures(endpoint)
        .and_then(|caps| caps[2].parse::<u16>().ok())
        .is_some_and(|port| port > 0)
}
