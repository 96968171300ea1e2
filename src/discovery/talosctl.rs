//! `talosctl get` transport

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use super::api::{NodeApi, ResourceItem, ResourceKind};
use super::DiscoveryError;

/// Reads resources by running `talosctl get <type> -o json`.
#[derive(Debug, Clone)]
pub struct TalosctlApi {
    binary: String,
    talosconfig: Option<PathBuf>,
    endpoints: Vec<String>,
    insecure: bool,
}

impl Default for TalosctlApi {
    fn default() -> Self {
        Self {
            binary: "talosctl".to_string(),
            talosconfig: None,
            endpoints: Vec::new(),
            insecure: false,
        }
    }
}

impl TalosctlApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_talosconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.talosconfig = Some(path.into());
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Talk to nodes in maintenance mode, without client certificates.
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Arguments for one `get` invocation.
    pub fn build_args(&self, node: &str, kind: ResourceKind) -> Vec<String> {
        let mut args = vec![
            "get".to_string(),
            kind.type_name().to_string(),
            "-n".to_string(),
            node.to_string(),
        ];
        if !self.endpoints.is_empty() {
            args.push("-e".to_string());
            args.push(self.endpoints.join(","));
        }
        if self.insecure {
            args.push("--insecure".to_string());
        } else if let Some(path) = &self.talosconfig {
            args.push("--talosconfig".to_string());
            args.push(path.display().to_string());
        }
        args.push("-o".to_string());
        args.push("json".to_string());
        args
    }
}

/// Parse the stream of JSON objects `talosctl get -o json` prints.
pub fn parse_resource_stream(output: &str) -> Result<Vec<ResourceItem>, String> {
    let mut items = Vec::new();
    for document in serde_json::Deserializer::from_str(output).into_iter::<Value>() {
        let document = document.map_err(|e| e.to_string())?;
        let id = document
            .pointer("/metadata/id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let spec = document.get("spec").cloned().unwrap_or(Value::Null);
        items.push(ResourceItem { id, spec });
    }
    Ok(items)
}

#[async_trait]
impl NodeApi for TalosctlApi {
    async fn list(&self, node: &str, kind: ResourceKind) -> Result<Vec<ResourceItem>, DiscoveryError> {
        let args = self.build_args(node, kind);
        debug!(node, resource = %kind, "talosctl {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DiscoveryError::Unavailable {
                resource: kind.to_string(),
                reason: format!("failed to run {}: {e}", self.binary),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoveryError::Unavailable {
                resource: kind.to_string(),
                reason: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_resource_stream(&stdout).map_err(|reason| DiscoveryError::Unavailable {
            resource: kind.to_string(),
            reason,
        })
    }
}
