//! Certificate authority and issuance for the secure-access sidecar.
//!
//! One self-signed authority is generated per operator and reused across
//! conversions: every sidecar server certificate chains to it, and the
//! operator's client certificate is what the sidecars accept for mutual
//! TLS. Keys are ECDSA P-256.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rand::RngCore as _;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde_yaml::Value;
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::typed_to_document;

/// Validity window for the authority certificate.
const CA_VALIDITY_DAYS: i64 = 3650;
/// Validity window for issued leaf certificates.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// File base name of the persisted authority pair.
pub const CA_FILE_BASE: &str = "ca";
/// File base name of the persisted operator client pair.
pub const CLIENT_FILE_BASE: &str = "client";

/// Logical role of a certificate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateRole {
    Authority,
    Server,
    Client,
}

/// A PEM-encoded certificate and its private key.
#[derive(Clone)]
pub struct CertificateSet {
    pub role: CertificateRole,
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for CertificateSet {
    // Key material stays out of debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSet")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

fn cert_error(err: rcgen::Error) -> Error {
    Error::CertMaterialMissing {
        reason: err.to_string(),
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

fn common_name(params: &mut CertificateParams, cn: &str) {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
}

/// Generate the self-signed authority for the sidecar mTLS scheme.
pub fn generate_ca(cn: &str) -> Result<CertificateSet> {
    let key = KeyPair::generate().map_err(cert_error)?;
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(cert_error)?;
    common_name(&mut params, cn);
    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(CA_VALIDITY_DAYS);
    let cert = params.self_signed(&key).map_err(cert_error)?;
    debug!(%cn, "generated certificate authority");
    Ok(CertificateSet {
        role: CertificateRole::Authority,
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Reload a persisted authority so it can sign new leaves.
struct Issuer {
    cert: Certificate,
    key: KeyPair,
}

fn issuer_from(ca: &CertificateSet) -> Result<Issuer> {
    let key = KeyPair::from_pem(&ca.key_pem).map_err(cert_error)?;
    let params = CertificateParams::from_ca_cert_pem(&ca.cert_pem).map_err(cert_error)?;
    let cert = params.self_signed(&key).map_err(cert_error)?;
    Ok(Issuer { cert, key })
}

/// Issue a server certificate for one workload's sidecar. `sans` must be
/// non-empty; IP entries are classified automatically.
pub fn generate_server_cert(
    ca: &CertificateSet,
    cn: &str,
    sans: &[String],
) -> Result<CertificateSet> {
    if sans.is_empty() {
        return Err(Error::CertMaterialMissing {
            reason: "server certificate needs at least one subject alternative name".to_string(),
        });
    }
    let issuer = issuer_from(ca)?;
    let key = KeyPair::generate().map_err(cert_error)?;
    let mut params = CertificateParams::new(sans.to_vec()).map_err(cert_error)?;
    common_name(&mut params, cn);
    params.serial_number = Some(random_serial());
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);
    let cert = params
        .signed_by(&key, &issuer.cert, &issuer.key)
        .map_err(cert_error)?;
    debug!(%cn, sans = sans.len(), "issued server certificate");
    Ok(CertificateSet {
        role: CertificateRole::Server,
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Issue the operator's client certificate for mutual TLS.
pub fn generate_client_cert(ca: &CertificateSet, cn: &str) -> Result<CertificateSet> {
    let issuer = issuer_from(ca)?;
    let key = KeyPair::generate().map_err(cert_error)?;
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(cert_error)?;
    common_name(&mut params, cn);
    params.serial_number = Some(random_serial());
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);
    let cert = params
        .signed_by(&key, &issuer.cert, &issuer.key)
        .map_err(cert_error)?;
    Ok(CertificateSet {
        role: CertificateRole::Client,
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Persist a pair as `<base>-cert.pem` / `<base>-key.pem` under `dir`
/// with owner-only permissions. Returns both paths.
pub async fn save(set: &CertificateSet, dir: &Path, base: &str) -> Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::file_write(dir, e))?;
    let cert_path = dir.join(format!("{base}-cert.pem"));
    let key_path = dir.join(format!("{base}-key.pem"));
    write_owner_only(&cert_path, &set.cert_pem).await?;
    write_owner_only(&key_path, &set.key_pem).await?;
    Ok((cert_path, key_path))
}

/// Write PEM material into a file that is owner-only from the moment it
/// exists. A leftover file is removed first so the mode applies at
/// creation.
async fn write_owner_only(path: &Path, contents: &str) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::file_write(path, e)),
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::file_write(path, e))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| Error::file_write(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::file_write(path, e))?;
    Ok(())
}

/// Load a persisted pair, failing with a pointer at `coco certs init`
/// when the material is absent.
pub async fn load(dir: &Path, base: &str, role: CertificateRole) -> Result<CertificateSet> {
    let cert_path = dir.join(format!("{base}-cert.pem"));
    let key_path = dir.join(format!("{base}-key.pem"));
    let cert_pem = read_pem(&cert_path).await?;
    let key_pem = read_pem(&key_path).await?;
    Ok(CertificateSet {
        role,
        cert_pem,
        key_pem,
    })
}

async fn read_pem(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::CertMaterialMissing {
            reason: format!(
                "cannot read '{}': {e}; run `coco certs init` first",
                path.display()
            ),
        })
}

/// Kubernetes TLS Secret carrying this pair, for plan-mode review.
pub fn tls_secret_document(set: &CertificateSet, name: &str, namespace: &str) -> Result<Value> {
    let mut data = BTreeMap::new();
    data.insert(
        "tls.crt".to_string(),
        ByteString(set.cert_pem.clone().into_bytes()),
    );
    data.insert(
        "tls.key".to_string(),
        ByteString(set.key_pem.clone().into_bytes()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    };
    typed_to_document(&secret)
}
