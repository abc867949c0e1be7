//! The conversion pipeline: rewrites one workload manifest for a
//! confidential-containers runtime class and coordinates the side
//! effects around it (sealed secrets, TLS material, KBS uploads,
//! companion manifests, optional apply).
//!
//! External reach goes through three injected capabilities so the
//! pipeline runs identically against a live cluster and against
//! in-memory fakes: [`ClusterInspector`] for reads, [`KbsTransport`]
//! for resource delivery, and [`ApplyDriver`] for manifest writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::Value;
use tracing::{info, instrument, warn};

use crate::cluster::ClusterInspector;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::initdata::{self, INITDATA_ANNOTATION, ImagePullSecretInfo};
use crate::kbs::{
    self, ATTESTATION_STATUS_PATH, ATTESTATION_STATUS_VALUE, KbsRepository, KbsTarget,
    KbsTransport,
};
use crate::kubectl::ApplyDriver;
use crate::manifest::{self, ManifestSet, sibling_path};
use crate::secrets::{self, canonical_key};
use crate::sidecar::{self, SanOptions};
use crate::tls::{self, CertificateRole};

/// Name of the injected attestation-check init container.
pub const INIT_CONTAINER_NAME: &str = "coco-attestation-check";

const KIND_SECRET_KEY: &str = "secret-key";
const KIND_IMAGE_PULL: &str = "image-pull-secret";
const KIND_TLS: &str = "tls";
const KIND_STATUS: &str = "status";

/// Per-invocation switches, distinct from the merged [`Config`]
/// defaults.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Input manifest file.
    pub filename: PathBuf,
    /// Directory the input must not escape.
    pub load_root: PathBuf,
    /// Namespace from the command line, when given.
    pub namespace: Option<String>,
    /// Seal secret references and upload their material.
    pub convert_secrets: bool,
    /// Prepend the attestation-check init container.
    pub add_init_container: bool,
    /// Apply mode: upload to KBS and apply manifests. Off means plan
    /// mode, which only writes files next to the input.
    pub apply: bool,
    /// Attach the initdata annotation.
    pub initdata: bool,
    /// Subject alternative names for the sidecar server certificate.
    pub sidecar_sans: SanOptions,
    /// Directory holding the operator CA material.
    pub cert_dir: PathBuf,
}

/// What one conversion did: the rewritten workload, every file written,
/// every KBS write planned or performed, and the warnings raised.
#[derive(Debug, Serialize)]
pub struct ConvertReport {
    pub workload: String,
    pub kind: String,
    pub namespace: String,
    pub runtime_class: String,
    pub files: Vec<PathBuf>,
    pub kbs_targets: Vec<KbsTarget>,
    pub replaced_secrets: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub applied: bool,
}

/// Settle the workload namespace: flag wins, then the manifest, then
/// the operator's current context, then `default`. A flag that
/// contradicts the manifest is fatal before any side effect.
pub fn resolve_namespace(
    flag: Option<&str>,
    manifest_ns: Option<&str>,
    context_ns: Option<&str>,
) -> Result<String> {
    let flag = flag.map(str::trim).filter(|s| !s.is_empty());
    let manifest_ns = manifest_ns.map(str::trim).filter(|s| !s.is_empty());
    match (flag, manifest_ns) {
        (Some(flag), Some(manifest)) if flag != manifest => Err(Error::NamespaceConflict {
            flag: flag.to_string(),
            manifest: manifest.to_string(),
        }),
        (Some(flag), _) => Ok(flag.to_string()),
        (None, Some(manifest)) => Ok(manifest.to_string()),
        (None, None) => Ok(context_ns
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
            .to_string()),
    }
}

/// Run the full conversion. Mutations accumulate in memory; nothing
/// touches the disk, the cluster, or KBS until every rewrite step has
/// succeeded, and committed KBS uploads are never rolled back.
#[instrument(level = "debug", skip_all, name = "convert", fields(filename = %options.filename.display()))]
pub async fn run<C, K, A>(
    options: &ConvertOptions,
    config: &Config,
    cluster: &C,
    kbs_transport: &K,
    apply_driver: &A,
) -> Result<ConvertReport>
where
    C: ClusterInspector,
    K: KbsTransport,
    A: ApplyDriver,
{
    let mut warnings: Vec<String> = Vec::new();
    let mut repository = KbsRepository::new();
    let mut files: Vec<PathBuf> = Vec::new();

    let mut set = ManifestSet::load(&options.filename, &options.load_root)
        .await
        .map_err(|e| e.at_step("load manifest"))?;

    let namespace = resolve_namespace(
        options.namespace.as_deref(),
        set.primary().namespace(),
        cluster.current_namespace().as_deref(),
    )?;

    let runtime_class = config.runtime_class.clone();
    set.primary_mut()
        .set_runtime_class(&runtime_class)
        .map_err(|e| e.at_step("set runtime class"))?;

    // Secret handling: inspect once, then seal and replace regular
    // references and record image-pull material for initdata.
    let mut replaced_secrets = BTreeMap::new();
    let mut sealed_docs: Vec<Value> = Vec::new();
    let mut image_pull_infos: Vec<ImagePullSecretInfo> = Vec::new();

    if options.convert_secrets {
        let refs = set
            .primary()
            .get_secret_refs()
            .map_err(|e| e.at_step("collect secret references"))?;
        let inspected = secrets::inspect(refs, &namespace, options.apply, cluster)
            .await
            .map_err(|e| e.at_step("collect secret references"))?;
        warnings.extend(inspected.warnings);

        for secret in &inspected.regular {
            if options.apply {
                for (key, value) in &secret.values {
                    repository.insert(
                        format!("{}/{}/{}", secret.namespace, secret.name, canonical_key(key)),
                        KIND_SECRET_KEY,
                        value.clone(),
                    );
                }
            } else {
                for key in &secret.keys {
                    repository.declare(
                        format!("{}/{}/{}", secret.namespace, secret.name, canonical_key(key)),
                        KIND_SECRET_KEY,
                    );
                }
            }
        }
        if !inspected.regular.is_empty() {
            let (substitutions, docs) = secrets::sealed_documents(&inspected.regular)
                .map_err(|e| e.at_step("transform secrets"))?;
            for (old, new) in &substitutions {
                set.primary_mut()
                    .replace_secret_reference(old, new)
                    .map_err(|e| e.at_step("transform secrets"))?;
            }
            replaced_secrets = substitutions;
            sealed_docs = docs;
        }

        for secret in &inspected.image_pull {
            if options.apply {
                for (key, value) in &secret.values {
                    repository.insert(
                        format!("{}/{}/{}", secret.namespace, secret.name, canonical_key(key)),
                        KIND_IMAGE_PULL,
                        value.clone(),
                    );
                }
            } else {
                for key in &secret.keys {
                    repository.declare(
                        format!("{}/{}/{}", secret.namespace, secret.name, canonical_key(key)),
                        KIND_IMAGE_PULL,
                    );
                }
            }
            if let Some(key) = secret.keys.first() {
                image_pull_infos.push(ImagePullSecretInfo {
                    namespace: secret.namespace.clone(),
                    secret_name: secret.name.clone(),
                    key: canonical_key(key),
                });
            }
        }
    }

    if options.add_init_container {
        set.primary_mut()
            .add_init_container(
                INIT_CONTAINER_NAME,
                &config.init_container_image(),
                &config.init_container_cmd(),
            )
            .map_err(|e| e.at_step("add init container"))?;
        if options.apply {
            repository.insert(
                ATTESTATION_STATUS_PATH,
                KIND_STATUS,
                ATTESTATION_STATUS_VALUE.to_vec(),
            );
        } else {
            repository.declare(ATTESTATION_STATUS_PATH, KIND_STATUS);
        }
    }

    let mut service_doc: Option<Value> = None;
    let mut tls_secret_doc: Option<Value> = None;

    if config.sidecar.enabled {
        let workload = set.primary().name().to_string();

        // Port conflicts abort before any certificate work.
        let (detected, port_warnings) = set
            .derive_forward_port()
            .map_err(|e| e.at_step("inject sidecar"))?;
        warnings.extend(port_warnings);
        let forward_port = sidecar::resolve_forward_port(
            config.sidecar.forward_port,
            detected,
            config.sidecar.https_port,
            &mut warnings,
        )
        .map_err(|e| e.at_step("inject sidecar"))?;

        let derived = sidecar::cert_uris(&workload, &namespace);
        let uris = sidecar::CertUris {
            server_cert: config
                .sidecar
                .tls_cert_uri
                .clone()
                .unwrap_or(derived.server_cert),
            server_key: config
                .sidecar
                .tls_key_uri
                .clone()
                .unwrap_or(derived.server_key),
            client_ca: config
                .sidecar
                .client_ca_uri
                .clone()
                .unwrap_or(derived.client_ca),
        };

        if !config.sidecar.no_certs {
            let ca = tls::load(&options.cert_dir, tls::CA_FILE_BASE, CertificateRole::Authority)
                .await
                .map_err(|e| e.at_step("load certificate authority"))?;
            let sans = sidecar::collect_sans(
                &options.sidecar_sans,
                &workload,
                &namespace,
                cluster,
                &mut warnings,
            )
            .await
            .map_err(|e| e.at_step("generate server certificate"))?;
            let server = tls::generate_server_cert(&ca, &workload, &sans)
                .map_err(|e| e.at_step("generate server certificate"))?;

            let (cert_path, key_path) = sidecar::server_cert_paths(&workload, &namespace);
            if options.apply {
                repository.insert(cert_path, KIND_TLS, server.cert_pem.clone().into_bytes());
                repository.insert(key_path, KIND_TLS, server.key_pem.clone().into_bytes());
                repository.insert(
                    sidecar::CLIENT_CA_PATH,
                    KIND_TLS,
                    ca.cert_pem.clone().into_bytes(),
                );
            } else {
                repository.declare(cert_path, KIND_TLS);
                repository.declare(key_path, KIND_TLS);
                repository.declare(sidecar::CLIENT_CA_PATH, KIND_TLS);
                tls_secret_doc = Some(
                    tls::tls_secret_document(
                        &server,
                        &sidecar::tls_resource_name(&workload),
                        &namespace,
                    )
                    .map_err(|e| e.at_step("generate server certificate"))?,
                );
            }
        }

        let container = sidecar::build_container(&config.sidecar, forward_port, &uris)
            .map_err(|e| e.at_step("inject sidecar"))?;
        set.primary_mut()
            .add_sidecar_container(container)
            .map_err(|e| e.at_step("inject sidecar"))?;

        let labels = set
            .primary()
            .get_pod_labels()
            .map_err(|e| e.at_step("inject sidecar"))?;
        service_doc = Some(
            sidecar::build_service(&workload, &namespace, &labels, config.sidecar.https_port)
                .map_err(|e| e.at_step("inject sidecar"))?,
        );
    }

    // All KBS writes go out in one batch, before the initdata that
    // references them is attached.
    if options.apply && !repository.is_empty() {
        let kbs_namespace = kbs::namespace_from_url(&config.trustee_server).unwrap_or_else(|| {
            warnings.push(format!(
                "cannot derive the KBS namespace from '{}'; assuming 'default'",
                config.trustee_server
            ));
            "default".to_string()
        });
        kbs_transport
            .wait_ready()
            .await
            .map_err(|e| e.at_step("upload KBS resources"))?;
        kbs_transport
            .upload(&kbs_namespace, &repository)
            .await
            .map_err(|e| e.at_step("upload KBS resources"))?;
    }

    if options.initdata {
        let (value, init_warnings) = initdata::build_annotation(config, &image_pull_infos)
            .map_err(|e| e.at_step("build initdata"))?;
        warnings.extend(init_warnings);
        set.primary_mut()
            .set_annotation(INITDATA_ANNOTATION, &value)
            .map_err(|e| e.at_step("build initdata"))?;
    }

    for (key, value) in &config.annotations {
        if value.trim().is_empty() {
            warnings.push(format!("skipping annotation '{key}' with an empty value"));
            continue;
        }
        set.primary_mut()
            .set_annotation(key, value)
            .map_err(|e| e.at_step("apply annotations"))?;
    }

    // Rewrites are done; everything below is output.
    let converted_path = set.primary().backup_path();
    let rendered = set.render().map_err(|e| e.at_step("write converted manifest"))?;
    write_file(&converted_path, &rendered)
        .await
        .map_err(|e| e.at_step("write converted manifest"))?;
    files.push(converted_path.clone());

    let source = set.primary().source().to_path_buf();

    let mut sealed_file: Option<PathBuf> = None;
    if !sealed_docs.is_empty() {
        let rendered = manifest::render_documents(&sealed_docs)
            .map_err(|e| e.at_step("write companion files"))?;
        let path = sibling_path(&source, "sealed-secrets");
        write_file(&path, &rendered)
            .await
            .map_err(|e| e.at_step("write companion files"))?;
        files.push(path.clone());
        sealed_file = Some(path);
    }

    let mut service_file: Option<PathBuf> = None;
    if let Some(doc) = &service_doc {
        let rendered = manifest::render_documents(std::slice::from_ref(doc))
            .map_err(|e| e.at_step("write companion files"))?;
        let path = sibling_path(&source, "sidecar-service");
        write_file(&path, &rendered)
            .await
            .map_err(|e| e.at_step("write companion files"))?;
        files.push(path.clone());
        service_file = Some(path);
    }

    if let Some(doc) = &tls_secret_doc {
        let rendered = manifest::render_documents(std::slice::from_ref(doc))
            .map_err(|e| e.at_step("write companion files"))?;
        let path = sibling_path(&source, "sidecar-tls");
        write_file(&path, &rendered)
            .await
            .map_err(|e| e.at_step("write companion files"))?;
        files.push(path);
    }

    if !repository.targets().is_empty() {
        let listing = kbs::render_listing(&config.trustee_server, repository.targets())
            .map_err(|e| e.at_step("write companion files"))?;
        let path = sibling_path(&source, "trustee-secrets");
        write_file(&path, &listing)
            .await
            .map_err(|e| e.at_step("write companion files"))?;
        files.push(path);
    }

    // Apply order: sealed secrets must exist before the workload that
    // references them; the Service follows the workload.
    let mut applied = false;
    if options.apply {
        if let Some(path) = &sealed_file {
            apply_driver
                .apply(path, &namespace)
                .await
                .map_err(|e| e.at_step("apply manifests"))?;
        }
        apply_driver
            .apply(&converted_path, &namespace)
            .await
            .map_err(|e| e.at_step("apply manifests"))?;
        if let Some(path) = &service_file {
            apply_driver
                .apply(path, &namespace)
                .await
                .map_err(|e| e.at_step("apply manifests"))?;
        }
        applied = true;
    }

    let report = ConvertReport {
        workload: set.primary().name().to_string(),
        kind: set.primary().kind().to_string(),
        namespace,
        runtime_class,
        files,
        kbs_targets: repository.into_targets(),
        replaced_secrets,
        warnings,
        applied,
    };
    for warning in &report.warnings {
        warn!("{warning}");
    }
    info!(
        workload = %report.workload,
        kind = %report.kind,
        files = report.files.len(),
        applied = report.applied,
        "conversion finished"
    );
    Ok(report)
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| Error::file_write(path, e))
}
