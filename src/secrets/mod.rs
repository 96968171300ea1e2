//! Cluster secrets bundle
//!
//! A bundle is generated once per cluster, persisted next to the chart as
//! `secrets.yaml` and loaded verbatim by every later render.

mod bundle;
mod generate;
pub mod pki;
mod version;

pub use bundle::{
    load, parse_bundle, persist, serialize_bundle, Certs, ClusterIdentity, ClusterSecrets,
    SecretsBundle, TrustdInfo,
};
pub use generate::{generate, generate_with_rng, issue_admin_certificate, ADMIN_ORGANIZATION};
pub use pki::{CertAndKey, KeyOnly};
pub use version::VersionContract;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors from secrets handling
#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("secrets bundle not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("invalid secrets bundle: {0}")]
    Invalid(String),

    #[error("refusing to overwrite existing file: {}", .0.display())]
    Exists(PathBuf),

    #[error("secret path not found: {0}")]
    PathMissing(String),

    #[error("invalid Talos version '{0}': expected vMAJOR.MINOR[.PATCH]")]
    VersionContract(String),

    #[error("certificate generation failed: {0}")]
    Pki(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for SecretsError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Missing(_) => ErrorKind::SecretsMissing,
            Self::Invalid(_) => ErrorKind::SecretsInvalid,
            Self::Exists(_) => ErrorKind::FilesystemExists,
            Self::PathMissing(_) => ErrorKind::SecretPathMissing,
            Self::VersionContract(_) => ErrorKind::VersionContract,
            Self::Pki(_) => ErrorKind::Internal,
            Self::Io { .. } => ErrorKind::Filesystem,
        }
    }
}
