//! Fresh bundle generation

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::{CryptoRng, Rng};
use tracing::info;

use super::bundle::{Certs, ClusterIdentity, ClusterSecrets, SecretsBundle, TrustdInfo};
use super::pki::{self, CertAndKey, KeyAlgorithm};
use super::{SecretsError, VersionContract};

/// Organization carried by admin client certificates.
pub const ADMIN_ORGANIZATION: &str = "os:admin";

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a bundle using the thread-local CSPRNG.
pub fn generate(contract: VersionContract, now: DateTime<Utc>) -> Result<SecretsBundle, SecretsError> {
    generate_with_rng(contract, now, &mut rand::thread_rng())
}

/// Generate a bundle with caller-supplied entropy for tokens and IDs.
///
/// Certificates are valid from `now`. Contracts from v1.0 on get a secretbox
/// encryption secret, older ones AES-CBC.
pub fn generate_with_rng<R: Rng + CryptoRng>(
    contract: VersionContract,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<SecretsBundle, SecretsError> {
    let encryption = random_secret(rng);
    let secrets = if contract.supports_secretbox() {
        ClusterSecrets {
            bootstraptoken: token(rng),
            secretboxencryptionsecret: Some(encryption),
            aescbcencryptionsecret: None,
        }
    } else {
        ClusterSecrets {
            bootstraptoken: token(rng),
            secretboxencryptionsecret: None,
            aescbcencryptionsecret: Some(encryption),
        }
    };

    let bundle = SecretsBundle {
        cluster: ClusterIdentity {
            id: random_secret(rng),
            secret: random_secret(rng),
        },
        secrets,
        trustdinfo: TrustdInfo { token: token(rng) },
        certs: Certs {
            etcd: pki::generate_ca("etcd", KeyAlgorithm::EcdsaP256, now)?,
            k8s: pki::generate_ca("kubernetes", KeyAlgorithm::EcdsaP256, now)?,
            k8saggregator: pki::generate_ca("front-proxy", KeyAlgorithm::EcdsaP256, now)?,
            k8sserviceaccount: pki::generate_key_only(KeyAlgorithm::EcdsaP256)?,
            os: pki::generate_ca("talos", KeyAlgorithm::Ed25519, now)?,
        },
    };
    info!(%contract, "generated secrets bundle");
    Ok(bundle)
}

/// Admin client certificate for talosconfig, signed by the OS CA.
pub fn issue_admin_certificate(
    bundle: &SecretsBundle,
    now: DateTime<Utc>,
) -> Result<CertAndKey, SecretsError> {
    pki::issue_client(&bundle.certs.os, ADMIN_ORGANIZATION, "admin", now)
}

/// 32 random bytes, base64 encoded.
fn random_secret<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Kubernetes bootstrap token shape: `[a-z0-9]{6}.[a-z0-9]{16}`.
fn token<R: Rng>(rng: &mut R) -> String {
    let mut pick = |len: usize| -> String {
        (0..len)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    };
    let id = pick(6);
    let secret = pick(16);
    format!("{id}.{secret}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use regex::Regex;

    fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_generated_bundle_validates() {
        let bundle = generate(VersionContract::new(1, 9), clock()).unwrap();
        bundle.validate().unwrap();
        assert!(bundle.secrets.secretboxencryptionsecret.is_some());
        assert!(bundle.secrets.aescbcencryptionsecret.is_none());
    }

    #[test]
    fn test_old_contract_gets_aescbc() {
        let bundle = generate(VersionContract::new(0, 14), clock()).unwrap();
        assert!(bundle.secrets.secretboxencryptionsecret.is_none());
        assert!(bundle.secrets.aescbcencryptionsecret.is_some());
        assert_eq!(bundle.required_contract(), VersionContract::ANY);
    }

    #[test]
    fn test_token_shapes() {
        let bundle = generate(VersionContract::new(1, 9), clock()).unwrap();
        let shape = Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").unwrap();
        assert!(shape.is_match(&bundle.secrets.bootstraptoken));
        assert!(shape.is_match(&bundle.trustdinfo.token));
    }

    #[test]
    fn test_injected_rng_fixes_tokens() {
        let a = generate_with_rng(VersionContract::new(1, 9), clock(), &mut StdRng::seed_from_u64(7)).unwrap();
        let b = generate_with_rng(VersionContract::new(1, 9), clock(), &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.cluster, b.cluster);
        assert_eq!(a.secrets, b.secrets);
        assert_eq!(a.trustdinfo, b.trustdinfo);
    }

    #[test]
    fn test_admin_certificate_from_bundle() {
        let bundle = generate(VersionContract::new(1, 9), clock()).unwrap();
        let admin = issue_admin_certificate(&bundle, clock()).unwrap();
        let pem = pki::decode_pem(&admin.crt, "crt").unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
