//! Secrets bundle document, persistence and validation

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::pki::{check_ca, CertAndKey, KeyOnly};
use super::{SecretsError, VersionContract};

/// Cluster identity and PKI, laid out like `talosctl gen secrets` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsBundle {
    #[serde(default)]
    pub cluster: ClusterIdentity,
    #[serde(default)]
    pub secrets: ClusterSecrets,
    #[serde(default)]
    pub trustdinfo: TrustdInfo,
    #[serde(default)]
    pub certs: Certs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSecrets {
    #[serde(default)]
    pub bootstraptoken: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretboxencryptionsecret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aescbcencryptionsecret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustdInfo {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certs {
    #[serde(default)]
    pub etcd: CertAndKey,
    #[serde(default)]
    pub k8s: CertAndKey,
    #[serde(default)]
    pub k8saggregator: CertAndKey,
    #[serde(default)]
    pub k8sserviceaccount: KeyOnly,
    #[serde(default)]
    pub os: CertAndKey,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Parse a bundle from YAML text and validate it.
pub fn parse_bundle(content: &str) -> Result<SecretsBundle, SecretsError> {
    let bundle: SecretsBundle =
        serde_yaml::from_str(content).map_err(|e| SecretsError::Invalid(e.to_string()))?;
    bundle.validate()?;
    Ok(bundle)
}

/// Serialize a bundle to YAML text.
pub fn serialize_bundle(bundle: &SecretsBundle) -> Result<String, SecretsError> {
    serde_yaml::to_string(bundle).map_err(|e| SecretsError::Invalid(e.to_string()))
}

impl SecretsBundle {
    /// Check that every sub-bundle a render depends on is present.
    pub fn validate(&self) -> Result<(), SecretsError> {
        let required = [
            ("cluster.id", &self.cluster.id),
            ("cluster.secret", &self.cluster.secret),
            ("secrets.bootstraptoken", &self.secrets.bootstraptoken),
            ("trustdinfo.token", &self.trustdinfo.token),
            ("certs.os.crt", &self.certs.os.crt),
            ("certs.os.key", &self.certs.os.key),
            ("certs.k8s.crt", &self.certs.k8s.crt),
            ("certs.k8s.key", &self.certs.k8s.key),
            ("certs.etcd.crt", &self.certs.etcd.crt),
            ("certs.etcd.key", &self.certs.etcd.key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SecretsError::Invalid(format!("{name} is missing")));
            }
        }
        if self.secrets.secretboxencryptionsecret.is_none()
            && self.secrets.aescbcencryptionsecret.is_none()
        {
            return Err(SecretsError::Invalid(
                "no encryption-at-rest secret present".to_string(),
            ));
        }
        check_ca(&self.certs.os.crt, "certs.os.crt")
    }

    /// Lowest contract able to consume this bundle.
    pub fn required_contract(&self) -> VersionContract {
        if self.secrets.secretboxencryptionsecret.is_some() {
            VersionContract::SECRETBOX
        } else {
            VersionContract::ANY
        }
    }

    /// Fail when rendering for a contract older than the bundle.
    pub fn check_contract(&self, contract: VersionContract) -> Result<(), SecretsError> {
        let required = self.required_contract();
        if contract < required {
            return Err(SecretsError::Invalid(format!(
                "bundle requires Talos {required} or newer, rendering for {contract}"
            )));
        }
        Ok(())
    }

    /// Look up a field by dotted path, e.g. `certs.os.crt`.
    pub fn field(&self, path: &str) -> Result<String, SecretsError> {
        let tree = serde_json::to_value(self)
            .map_err(|e| SecretsError::Invalid(e.to_string()))?;
        match crate::values::get_path(&tree, path) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            _ => Err(SecretsError::PathMissing(path.to_string())),
        }
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Load a bundle from disk.
pub fn load(path: &Path) -> Result<SecretsBundle, SecretsError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SecretsError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(SecretsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    debug!(path = %path.display(), "loaded secrets bundle");
    parse_bundle(&content)
}

/// Write a bundle atomically with owner-only permissions.
///
/// An existing file is never replaced unless `force` is set.
pub fn persist(bundle: &SecretsBundle, path: &Path, force: bool) -> Result<(), SecretsError> {
    if !force && path.exists() {
        return Err(SecretsError::Exists(path.to_path_buf()));
    }
    let content = serialize_bundle(bundle)?;

    let io_err = |source| SecretsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    staged.write_all(content.as_bytes()).map_err(io_err)?;
    staged.as_file().sync_all().map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }

    if force {
        staged.persist(path).map_err(|e| io_err(e.error))?;
    } else {
        staged.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                SecretsError::Exists(path.to_path_buf())
            } else {
                io_err(e.error)
            }
        })?;
    }
    info!(path = %path.display(), "wrote secrets bundle");
    Ok(())
}
