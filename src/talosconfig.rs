//! Client configuration (`talosconfig`)
//!
//! The file `talosctl` reads to reach a cluster: named contexts holding
//! endpoints, default nodes and the admin client credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::secrets::{issue_admin_certificate, SecretsBundle, SecretsError};

/// File name of the project-local client configuration.
pub const TALOSCONFIG_FILE: &str = "talosconfig";

/// Endpoint written for freshly generated contexts.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1";

/// `~/.talos/config`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".talos")
        .join("config")
}

/// Errors from talosconfig handling
#[derive(Error, Debug)]
pub enum TalosconfigError {
    #[error("talosconfig not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("context '{0}' not found")]
    ContextNotFound(String),

    #[error("no current context set")]
    NoCurrentContext,

    #[error("failed to parse talosconfig: {0}")]
    Parse(String),

    #[error("failed to serialize talosconfig: {0}")]
    Serialize(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

impl Classify for TalosconfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Io { .. } => ErrorKind::Filesystem,
            Self::ContextNotFound(_) | Self::NoCurrentContext | Self::Parse(_) => {
                ErrorKind::Validation
            }
            Self::Serialize(_) => ErrorKind::Internal,
            Self::Secrets(e) => e.kind(),
        }
    }
}

/// One cluster as seen by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Base64 PEM of the OS CA certificate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
    /// Base64 PEM of the admin client certificate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crt: String,
    /// Base64 PEM of the admin client key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl Context {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }
}

/// The complete file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Talosconfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub contexts: BTreeMap<String, Context>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_talosconfig(content: &str) -> Result<Talosconfig, TalosconfigError> {
    if content.trim().is_empty() {
        return Ok(Talosconfig::default());
    }
    serde_yaml::from_str(content).map_err(|e| TalosconfigError::Parse(e.to_string()))
}

pub fn serialize_talosconfig(config: &Talosconfig) -> Result<String, TalosconfigError> {
    serde_yaml::to_string(config).map_err(|e| TalosconfigError::Serialize(e.to_string()))
}

/// A config with a single context named after the cluster, carrying a fresh
/// admin certificate issued from the bundle's OS CA.
pub fn for_cluster(
    cluster_name: &str,
    bundle: &SecretsBundle,
    now: DateTime<Utc>,
) -> Result<Talosconfig, TalosconfigError> {
    let admin = issue_admin_certificate(bundle, now)?;
    let context = Context {
        endpoints: vec![DEFAULT_ENDPOINT.to_string()],
        nodes: Vec::new(),
        ca: bundle.certs.os.crt.clone(),
        crt: admin.crt,
        key: admin.key,
    };
    let mut config = Talosconfig::default();
    config.add_context(cluster_name, context);
    config.set_current_context(cluster_name)?;
    Ok(config)
}

impl Talosconfig {
    pub fn add_context(&mut self, name: impl Into<String>, context: Context) {
        self.contexts.insert(name.into(), context);
    }

    pub fn remove_context(&mut self, name: &str) -> Option<Context> {
        let removed = self.contexts.remove(name);
        if self.context.as_deref() == Some(name) {
            self.context = None;
        }
        removed
    }

    pub fn set_current_context(&mut self, name: &str) -> Result<(), TalosconfigError> {
        if !self.contexts.contains_key(name) {
            return Err(TalosconfigError::ContextNotFound(name.to_string()));
        }
        self.context = Some(name.to_string());
        Ok(())
    }

    pub fn current(&self) -> Result<(&str, &Context), TalosconfigError> {
        let name = self
            .context
            .as_deref()
            .ok_or(TalosconfigError::NoCurrentContext)?;
        self.contexts
            .get(name)
            .map(|ctx| (name, ctx))
            .ok_or_else(|| TalosconfigError::ContextNotFound(name.to_string()))
    }
}

/// Which talosconfig to use: an explicit path (`~` expanded), else
/// `<root>/talosconfig` when present, else `~/.talos/config`.
pub fn resolve_path(explicit: Option<&str>, root: &Path) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return PathBuf::from(shellexpand::tilde(path).into_owned());
    }
    let local = root.join(TALOSCONFIG_FILE);
    if local.is_file() {
        local
    } else {
        default_config_path()
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

pub fn load(path: &Path) -> Result<Talosconfig, TalosconfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            TalosconfigError::NotFound(path.to_path_buf())
        } else {
            TalosconfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    parse_talosconfig(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{generate_with_rng, VersionContract};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_talosconfig() {
        let yaml = r#"
context: demo
contexts:
  demo:
    endpoints: [127.0.0.1]
    nodes: []
    ca: Y2E=
    crt: Y3J0
    key: a2V5
"#;
        let config = parse_talosconfig(yaml).unwrap();
        let (name, ctx) = config.current().unwrap();
        assert_eq!(name, "demo");
        assert_eq!(ctx.endpoints, vec!["127.0.0.1"]);
        assert_eq!(ctx.key, "a2V5");
        assert_eq!(parse_talosconfig("").unwrap(), Talosconfig::default());
    }

    #[test]
    fn test_for_cluster() {
        let bundle =
            generate_with_rng(VersionContract::new(1, 9), now(), &mut StdRng::seed_from_u64(1))
                .unwrap();
        let config = for_cluster("demo", &bundle, now()).unwrap();
        let (name, ctx) = config.current().unwrap();
        assert_eq!(name, "demo");
        assert_eq!(ctx.endpoints, vec![DEFAULT_ENDPOINT]);
        assert_eq!(ctx.ca, bundle.certs.os.crt);
        assert!(!ctx.crt.is_empty());
        assert!(!ctx.key.is_empty());

        let yaml = serialize_talosconfig(&config).unwrap();
        assert!(yaml.starts_with("context: demo"));
        assert_eq!(parse_talosconfig(&yaml).unwrap(), config);
    }

    #[test]
    fn test_context_management() {
        let mut config = Talosconfig::default();
        assert!(matches!(config.current(), Err(TalosconfigError::NoCurrentContext)));
        assert!(matches!(
            config.set_current_context("nope"),
            Err(TalosconfigError::ContextNotFound(_))
        ));

        config.add_context("a", Context::new(vec!["10.0.0.1".into()]).with_nodes(vec!["10.0.0.2".into()]));
        config.set_current_context("a").unwrap();
        assert_eq!(config.current().unwrap().1.nodes, vec!["10.0.0.2"]);
        assert!(config.remove_context("a").is_some());
        assert!(config.context.is_none());
    }

    #[test]
    fn test_resolve_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_path(Some("/tmp/tc"), dir.path()), PathBuf::from("/tmp/tc"));
        assert_eq!(resolve_path(None, dir.path()), default_config_path());

        std::fs::write(dir.path().join(TALOSCONFIG_FILE), "").unwrap();
        assert_eq!(resolve_path(None, dir.path()), dir.path().join(TALOSCONFIG_FILE));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }
}
