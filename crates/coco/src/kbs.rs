//! KBS resource staging and upload.
//!
//! Writes are batched into a [`KbsRepository`] keyed by repository path
//! (`<namespace>/<name>/<key>`), staged under an owner-only temporary
//! directory, delivered by a [`KbsTransport`], and the staging area is
//! overwritten before removal so key material does not survive on disk.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use rand::RngCore as _;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// How long to wait for the KBS endpoint before the first write.
pub const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const READY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

/// Repository path of the attestation readiness marker polled by the
/// default init container.
pub const ATTESTATION_STATUS_PATH: &str = "default/attestation-status/status";
/// Contents of the readiness marker.
pub const ATTESTATION_STATUS_VALUE: &[u8] = b"attested";

/// One planned or performed KBS write, as recorded in the trustee
/// listing file.
#[derive(Debug, Clone, Serialize)]
pub struct KbsTarget {
    pub path: String,
    pub kind: String,
    /// Digest of the staged bytes; absent when the value will only be
    /// fetched from the cluster at apply time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// In-memory batch of KBS writes for one invocation.
#[derive(Debug, Default)]
pub struct KbsRepository {
    files: BTreeMap<String, Vec<u8>>,
    targets: Vec<KbsTarget>,
}

impl KbsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for upload under a repository path.
    pub fn insert(&mut self, path: impl Into<String>, kind: &str, bytes: Vec<u8>) {
        let path = path.into();
        let digest = Sha256::digest(&bytes);
        self.targets.push(KbsTarget {
            path: path.clone(),
            kind: kind.to_string(),
            sha256: Some(hex_string(&digest)),
        });
        self.files.insert(path, bytes);
    }

    /// Record a path that will be populated at apply time without
    /// staging any bytes now.
    pub fn declare(&mut self, path: impl Into<String>, kind: &str) {
        self.targets.push(KbsTarget {
            path: path.into(),
            kind: kind.to_string(),
            sha256: None,
        });
    }

    /// Whether any bytes are staged for upload.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn targets(&self) -> &[KbsTarget] {
        &self.targets
    }

    pub fn into_targets(self) -> Vec<KbsTarget> {
        self.targets
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Delivery of staged resources into the running KBS instance.
pub trait KbsTransport {
    /// Block until the KBS endpoint answers, within [`READY_TIMEOUT`].
    fn wait_ready(&self) -> impl Future<Output = Result<()>>;

    /// Deliver every staged file into the KBS running in `namespace`.
    fn upload(
        &self,
        namespace: &str,
        repository: &KbsRepository,
    ) -> impl Future<Output = Result<()>>;
}

/// Stand-in transport for invocations that never upload. Calling it is
/// a pipeline bug, reported as such.
#[derive(Debug, Default)]
pub struct NoTransport;

impl KbsTransport for NoTransport {
    async fn wait_ready(&self) -> Result<()> {
        Err(Error::KbsUnreachable {
            url: String::new(),
            reason: "uploads are disabled for this invocation".to_string(),
        })
    }

    async fn upload(&self, _namespace: &str, _repository: &KbsRepository) -> Result<()> {
        Err(Error::KbsUnreachable {
            url: String::new(),
            reason: "uploads are disabled for this invocation".to_string(),
        })
    }
}

/// Stage repository contents under a freshly-created private directory.
/// Callers must [`wipe`] the directory once the transfer is done.
pub async fn stage(repository: &KbsRepository) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("coco-kbs-")
        .tempdir()
        .map_err(|e| Error::UploadFailed {
            target: "staging directory".to_string(),
            reason: e.to_string(),
        })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| Error::file_write(dir.path(), e))?;
    }
    for (path, bytes) in repository.files() {
        check_relative(path)?;
        let dest = dir.path().join(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::file_write(parent, e))?;
        }
        tokio::fs::write(&dest, bytes)
            .await
            .map_err(|e| Error::file_write(&dest, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| Error::file_write(&dest, e))?;
        }
    }
    debug!(files = repository.files().len(), dir = %dir.path().display(), "staged KBS resources");
    Ok(dir)
}

/// Repository paths come from manifest and configuration input; only
/// plain relative segments may reach the filesystem.
fn check_relative(path: &str) -> Result<()> {
    let ok = Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(Error::PathTraversal {
            path: path.to_string(),
            root: "staging directory".to_string(),
        })
    }
}

/// Overwrite every staged file (random, zeros, random) and remove the
/// directory.
pub async fn wipe(dir: TempDir) -> Result<()> {
    for file in collect_files(dir.path()).await? {
        overwrite_file(&file).await?;
    }
    dir.close().map_err(|e| Error::UploadFailed {
        target: "staging directory".to_string(),
        reason: e.to_string(),
    })
}

async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::file_write(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_write(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::file_write(&entry.path(), e))?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

async fn overwrite_file(path: &Path) -> Result<()> {
    let len = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::file_write(path, e))?
        .len() as usize;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| Error::file_write(path, e))?;
    for pass in 0..3 {
        let buffer = if pass == 1 {
            vec![0u8; len]
        } else {
            random_bytes(len)
        };
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| Error::file_write(path, e))?;
        file.write_all(&buffer)
            .await
            .map_err(|e| Error::file_write(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::file_write(path, e))?;
    }
    Ok(())
}

/// Namespace the KBS pod runs in, derived from a cluster-local service
/// URL such as `https://kbs.coco-system.svc.cluster.local:8080`.
pub fn namespace_from_url(trustee_server: &str) -> Option<String> {
    let url = Url::parse(trustee_server).ok()?;
    let host = url.host_str()?;
    let labels: Vec<&str> = host.split('.').collect();
    match labels.as_slice() {
        [_service, namespace, "svc", ..] => Some((*namespace).to_string()),
        _ => None,
    }
}

/// Poll the KBS HTTP endpoint until it answers or [`READY_TIMEOUT`]
/// elapses. Any HTTP response counts as ready; only connection failures
/// keep the poll going.
pub async fn wait_for_endpoint(url: &str) -> Result<()> {
    // Readiness only; no payload crosses this connection, and the KBS
    // usually serves a certificate our host does not trust.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(READY_POLL_INTERVAL)
        .build()
        .map_err(|e| Error::KbsUnreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    let mut last_error = String::from("no attempt made");
    while tokio::time::Instant::now() < deadline {
        match client.get(url).send().await {
            Ok(_) => {
                debug!(%url, "KBS endpoint answered");
                return Ok(());
            }
            Err(err) => last_error = err.to_string(),
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    Err(Error::KbsUnreachable {
        url: url.to_string(),
        reason: format!(
            "no answer within {}s: {last_error}",
            READY_TIMEOUT.as_secs()
        ),
    })
}

/// Declarative listing of the KBS writes planned or performed, written
/// next to the converted manifest.
#[derive(Debug, Serialize)]
struct TrusteeListing<'a> {
    trustee_server: &'a str,
    resources: &'a [KbsTarget],
}

pub fn render_listing(trustee_server: &str, targets: &[KbsTarget]) -> Result<String> {
    serde_yaml::to_string(&TrusteeListing {
        trustee_server,
        resources: targets,
    })
    .map_err(|e| Error::config_invalid(format!("failed to render trustee listing: {e}")))
}
