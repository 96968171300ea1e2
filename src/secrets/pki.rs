//! Certificate authorities and client certificates
//!
//! Keys and certificates are produced by `rcgen` and stored as base64 of
//! their PEM text, the encoding `talosctl` uses in bundles and talosconfig.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256, PKCS_ED25519,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::SecretsError;

/// Lifetime of generated authorities.
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Lifetime of issued admin client certificates.
pub const CLIENT_VALIDITY_DAYS: i64 = 365;

/// Base64-encoded PEM certificate and private key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertAndKey {
    #[serde(default)]
    pub crt: String,
    #[serde(default)]
    pub key: String,
}

/// Base64-encoded PEM private key without a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOnly {
    #[serde(default)]
    pub key: String,
}

/// Key algorithm of a generated pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::Ed25519 => &PKCS_ED25519,
            Self::EcdsaP256 => &PKCS_ECDSA_P256_SHA256,
        }
    }
}

pub fn encode_pem(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

pub fn decode_pem(encoded: &str, what: &str) -> Result<String, SecretsError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SecretsError::Invalid(format!("{what} is not valid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|_| SecretsError::Invalid(format!("{what} is not UTF-8 PEM")))
}

fn to_offset(now: DateTime<Utc>) -> Result<OffsetDateTime, SecretsError> {
    OffsetDateTime::from_unix_timestamp(now.timestamp())
        .map_err(|e| SecretsError::Pki(format!("clock out of range: {e}")))
}

fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair, SecretsError> {
    KeyPair::generate_for(algorithm.signature_algorithm())
        .map_err(|e| SecretsError::Pki(format!("key generation failed: {e}")))
}

/// A private key with no certificate (service-account signing key).
pub fn generate_key_only(algorithm: KeyAlgorithm) -> Result<KeyOnly, SecretsError> {
    let key = generate_key(algorithm)?;
    Ok(KeyOnly {
        key: encode_pem(&key.serialize_pem()),
    })
}

/// Self-signed certificate authority valid for ten years from `now`.
pub fn generate_ca(
    organization: &str,
    algorithm: KeyAlgorithm,
    now: DateTime<Utc>,
) -> Result<CertAndKey, SecretsError> {
    let key = generate_key(algorithm)?;

    let mut params = CertificateParams::default();
    let not_before = to_offset(now)?;
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(CA_VALIDITY_DAYS);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key)
        .map_err(|e| SecretsError::Pki(format!("failed to self-sign {organization} CA: {e}")))?;

    Ok(CertAndKey {
        crt: encode_pem(&cert.pem()),
        key: encode_pem(&key.serialize_pem()),
    })
}

/// Client certificate signed by `ca`, carrying `organization` as its role.
pub fn issue_client(
    ca: &CertAndKey,
    organization: &str,
    common_name: &str,
    now: DateTime<Utc>,
) -> Result<CertAndKey, SecretsError> {
    let ca_cert_pem = decode_pem(&ca.crt, "CA certificate")?;
    let ca_key_pem = decode_pem(&ca.key, "CA key")?;

    let ca_key = KeyPair::from_pem(&ca_key_pem)
        .map_err(|e| SecretsError::Invalid(format!("failed to parse CA key: {e}")))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
        .map_err(|e| SecretsError::Invalid(format!("failed to parse CA certificate: {e}")))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| SecretsError::Pki(format!("failed to reconstruct CA certificate: {e}")))?;

    // Client keys follow the authority's algorithm.
    let algorithm = if ca_key.algorithm() == &PKCS_ED25519 {
        KeyAlgorithm::Ed25519
    } else {
        KeyAlgorithm::EcdsaP256
    };
    let client_key = generate_key(algorithm)?;

    let mut params = CertificateParams::default();
    let not_before = to_offset(now)?;
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(CLIENT_VALIDITY_DAYS);
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let cert = params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .map_err(|e| SecretsError::Pki(format!("failed to issue client certificate: {e}")))?;

    Ok(CertAndKey {
        crt: encode_pem(&cert.pem()),
        key: encode_pem(&client_key.serialize_pem()),
    })
}

/// Parse a base64 PEM certificate and require it to be a CA.
pub fn check_ca(encoded: &str, what: &str) -> Result<(), SecretsError> {
    let pem_text = decode_pem(encoded, what)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_text.as_bytes())
        .map_err(|e| SecretsError::Invalid(format!("{what} is not PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| SecretsError::Invalid(format!("{what} is not an X.509 certificate: {e}")))?;
    if !cert.is_ca() {
        return Err(SecretsError::Invalid(format!("{what} is not a certificate authority")));
    }
    Ok(())
}
