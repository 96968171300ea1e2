//! Inputs of one render invocation

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::secrets::SecretsBundle;
use crate::values::ValueSources;

pub const DEFAULT_TALOS_VERSION: &str = "v1.9.0";
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.31.2";
pub const SECRETS_FILE: &str = "secrets.yaml";
pub const NODES_DIR: &str = "nodes";

/// Where the secrets bundle comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SecretsSource {
    Path(PathBuf),
    /// A bundle already in memory, e.g. one just generated by `init`.
    Bundle(Arc<SecretsBundle>),
    Without,
}

/// Per-node overlay: a file or an inline value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    File(PathBuf),
    Inline(Value),
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub root: PathBuf,
    pub template_files: Vec<String>,
    pub value_files: Vec<PathBuf>,
    pub values: Vec<String>,
    pub string_values: Vec<String>,
    pub file_values: Vec<String>,
    pub json_values: Vec<String>,
    /// `None` means `<root>/secrets.yaml`.
    pub secrets: Option<SecretsSource>,
    pub offline: bool,
    pub kubernetes_version: String,
    pub talos_version: String,
    pub user_details: bool,
    pub nodes: Vec<String>,
    pub endpoints: Vec<String>,
    pub templates_have_modeline: bool,
    /// Explicit overlays by node. Nodes without one use `nodes/<node>.yaml`
    /// when that file exists.
    pub overlays: BTreeMap<String, Overlay>,
    pub now: DateTime<Utc>,
}

impl RenderOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            template_files: Vec::new(),
            value_files: Vec::new(),
            values: Vec::new(),
            string_values: Vec::new(),
            file_values: Vec::new(),
            json_values: Vec::new(),
            secrets: None,
            offline: false,
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            user_details: false,
            nodes: Vec::new(),
            endpoints: Vec::new(),
            templates_have_modeline: true,
            overlays: BTreeMap::new(),
            now: Utc::now(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template_files.push(template.into());
        self
    }

    pub fn with_value_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.value_files.push(path.into());
        self
    }

    pub fn with_set(mut self, expr: impl Into<String>) -> Self {
        self.values.push(expr.into());
        self
    }

    pub fn with_secrets(mut self, source: SecretsSource) -> Self {
        self.secrets = Some(source);
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_overlay(mut self, node: impl Into<String>, overlay: Overlay) -> Self {
        self.overlays.insert(node.into(), overlay);
        self
    }

    pub fn with_talos_version(mut self, version: impl Into<String>) -> Self {
        self.talos_version = version.into();
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_modeline(mut self, enabled: bool) -> Self {
        self.templates_have_modeline = enabled;
        self
    }

    /// Value sources with relative files resolved against the root.
    pub fn value_sources(&self) -> ValueSources {
        ValueSources {
            files: self.value_files.iter().map(|p| self.resolve(p)).collect(),
            values: self.values.clone(),
            string_values: self.string_values.clone(),
            file_values: self.file_values.clone(),
            json_values: self.json_values.clone(),
        }
    }

    pub fn secrets_source(&self) -> SecretsSource {
        self.secrets
            .clone()
            .unwrap_or_else(|| SecretsSource::Path(self.root.join(SECRETS_FILE)))
    }

    /// The overlay for `node`: explicit, or `nodes/<node>.yaml` if present.
    pub fn overlay_for(&self, node: &str) -> Option<Overlay> {
        if let Some(explicit) = self.overlays.get(node) {
            return Some(explicit.clone());
        }
        let default = self.root.join(NODES_DIR).join(format!("{node}.yaml"));
        default.is_file().then_some(Overlay::File(default))
    }

    /// `path` relative to the root unless already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// A template path as the chart knows it (relative to the root).
    pub fn chart_path(&self, template: &str) -> String {
        let path = Path::new(template);
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches("./")
            .to_string()
    }
}
