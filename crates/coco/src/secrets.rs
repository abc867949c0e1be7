//! Secret reference classification, cluster-backed key enumeration, and
//! the sealed-secret envelope codec.
//!
//! A sealed secret replaces the payload of a Kubernetes Secret with a
//! pointer into the KBS. The guest-side confidential data hub resolves
//! the pointer after attestation, so the cleartext never lands in etcd.

use std::collections::{BTreeMap, BTreeSet};

use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, instrument};

use crate::cluster::ClusterInspector;
use crate::error::{Error, Result};
use crate::manifest::typed_to_document;

/// Leading tag of a sealed envelope. The JWS header is a fixed
/// placeholder: sealed secrets are not signed today, and the guest
/// tooling expects these exact literals.
pub const SEALED_HEADER: &str = "sealed.fakejwsheader";
/// Trailing placeholder where a JWS signature would sit.
pub const SEALED_SIGNATURE: &str = "fakesignature";

const SEALED_VERSION: &str = "0.1.0";

/// How a workload consumes a referenced secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretUsage {
    EnvVar { container: String, env_var: String },
    EnvFrom { container: String },
    Volume {
        volume_name: String,
        items: Option<Vec<String>>,
    },
    ImagePullSecret,
}

impl SecretUsage {
    /// Short label used in warnings and error text.
    pub fn label(&self) -> &'static str {
        match self {
            SecretUsage::EnvVar { .. } => "env",
            SecretUsage::EnvFrom { .. } => "envFrom",
            SecretUsage::Volume { .. } => "volume",
            SecretUsage::ImagePullSecret => "imagePullSecret",
        }
    }
}

/// One secret referenced by a workload, with every usage that mentions
/// it. `needs_lookup` is set when the manifest alone cannot enumerate
/// the keys (envFrom, itemless volumes, image-pull secrets).
#[derive(Debug, Clone)]
pub struct SecretRef {
    pub name: String,
    pub namespace: Option<String>,
    pub needs_lookup: bool,
    pub keys: BTreeSet<String>,
    pub usages: Vec<SecretUsage>,
}

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            needs_lookup: false,
            keys: BTreeSet::new(),
            usages: Vec::new(),
        }
    }

    /// Fold another usage of the same secret into this reference.
    pub fn record(
        &mut self,
        usage: SecretUsage,
        keys: impl IntoIterator<Item = String>,
        needs_lookup: bool,
    ) {
        self.keys.extend(keys);
        self.needs_lookup |= needs_lookup;
        if !self.usages.contains(&usage) {
            self.usages.push(usage);
        }
    }

    pub fn is_image_pull(&self) -> bool {
        self.usages
            .iter()
            .any(|usage| matches!(usage, SecretUsage::ImagePullSecret))
    }

    /// `name (env, volume)` summary for error messages.
    pub fn summary(&self) -> String {
        let mut labels: Vec<&str> = self.usages.iter().map(SecretUsage::label).collect();
        labels.dedup();
        format!("{} ({})", self.name, labels.join(", "))
    }
}

/// A secret whose keys (and, when fetched, values) are fully known.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub name: String,
    pub namespace: String,
    /// Original Kubernetes data keys, sorted.
    pub keys: Vec<String>,
    /// Key bytes, populated only when values were fetched.
    pub values: BTreeMap<String, Vec<u8>>,
    pub usages: Vec<SecretUsage>,
}

/// Outcome of inspecting every reference of one workload.
#[derive(Debug, Default)]
pub struct InspectedSecrets {
    pub regular: Vec<ResolvedSecret>,
    pub image_pull: Vec<ResolvedSecret>,
    pub warnings: Vec<String>,
}

/// Canonical KBS key name for a Kubernetes secret data key: the legacy
/// `.dockercfg` key maps to `.dockerconfigjson`, and a leading dot is
/// dropped so the key is usable as a path segment.
pub fn canonical_key(key: &str) -> String {
    let key = if key == ".dockercfg" {
        ".dockerconfigjson"
    } else {
        key
    };
    key.trim_start_matches('.').to_string()
}

/// Resolve every reference against the cluster in one pass.
///
/// References with inline keys only touch the cluster when
/// `fetch_values` is set; everything else requires a lookup, and a
/// cluster outage aborts before any partial write with the full list of
/// references that made the lookup necessary. When the manifest declares
/// no image-pull secret and the cluster is reachable, the `default`
/// service account is consulted as a best-effort fallback.
#[instrument(level = "debug", skip_all, fields(references = refs.len()))]
pub async fn inspect<C: ClusterInspector>(
    refs: Vec<SecretRef>,
    workload_namespace: &str,
    fetch_values: bool,
    cluster: &C,
) -> Result<InspectedSecrets> {
    let mut out = InspectedSecrets::default();
    let mut refs = refs;

    if !refs.iter().any(SecretRef::is_image_pull) && cluster.available() {
        match cluster
            .service_account_pull_secrets(workload_namespace, "default")
            .await
        {
            Ok(names) => {
                for name in names {
                    debug!(%name, "adopting image-pull secret from the default service account");
                    let mut fallback = SecretRef::new(name);
                    fallback.record(SecretUsage::ImagePullSecret, [], true);
                    refs.push(fallback);
                }
            }
            Err(err) => out.warnings.push(format!(
                "could not read the default service account for image-pull secrets: {err}"
            )),
        }
    }

    let pending: Vec<String> = refs
        .iter()
        .filter(|r| r.needs_lookup || fetch_values)
        .map(SecretRef::summary)
        .collect();

    for reference in refs {
        let namespace = reference
            .namespace
            .clone()
            .unwrap_or_else(|| workload_namespace.to_string());
        let mut keys: Vec<String> = reference.keys.iter().cloned().collect();
        let mut values = BTreeMap::new();

        if reference.needs_lookup || fetch_values {
            let data = match cluster.secret_data(&namespace, &reference.name).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    return Err(Error::SecretNotFound {
                        resource: Error::secret_resource(&reference.name, &namespace),
                    })
                }
                Err(Error::SecretClusterUnreachable { reason, .. }) => {
                    return Err(Error::SecretClusterUnreachable {
                        references: pending,
                        reason,
                    })
                }
                Err(err) => return Err(err),
            };
            if reference.needs_lookup {
                keys = data.keys().cloned().collect();
                // A Secret with no data cannot satisfy the reference.
                if keys.is_empty() {
                    return Err(Error::SecretQueryFailed {
                        resource: Error::secret_resource(&reference.name, &namespace),
                        reason: "secret has no data keys".to_string(),
                    });
                }
            }
            if fetch_values {
                for key in &keys {
                    match data.get(key) {
                        Some(bytes) => {
                            values.insert(key.clone(), bytes.clone());
                        }
                        None => {
                            return Err(Error::SecretQueryFailed {
                                resource: Error::secret_resource(&reference.name, &namespace),
                                reason: format!("key '{key}' is not present"),
                            })
                        }
                    }
                }
            }
        }

        let resolved = ResolvedSecret {
            name: reference.name.clone(),
            namespace,
            keys,
            values,
            usages: reference.usages.clone(),
        };
        if reference.is_image_pull() {
            out.image_pull.push(resolved);
        } else {
            out.regular.push(resolved);
        }
    }

    Ok(out)
}

/// Wire body of a sealed envelope. Field names are the on-the-wire
/// contract; `provider_settings` stays snake_case.
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedSecretBody {
    pub version: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    pub provider: String,
    pub provider_settings: serde_json::Map<String, serde_json::Value>,
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

/// Render the four-part sealed envelope for one KBS URI.
pub fn seal_uri(uri: &str) -> Result<String> {
    let body = SealedSecretBody {
        version: SEALED_VERSION.to_string(),
        type_: "vault".to_string(),
        name: uri.to_string(),
        provider: "kbs".to_string(),
        provider_settings: serde_json::Map::new(),
        annotations: serde_json::Map::new(),
    };
    let json = serde_json::to_vec(&body).map_err(|e| Error::UploadFailed {
        target: "sealed-secret envelope".to_string(),
        reason: e.to_string(),
    })?;
    Ok(format!(
        "{SEALED_HEADER}.{}.{SEALED_SIGNATURE}",
        BASE64_URL_SAFE_NO_PAD.encode(json)
    ))
}

/// Parse an envelope back into its body. Mostly useful for tooling and
/// tests; the guest side does the authoritative decode.
pub fn unseal(envelope: &str) -> Result<SealedSecretBody> {
    let parts: Vec<&str> = envelope.split('.').collect();
    let [tag, header, body, signature] = parts.as_slice() else {
        return Err(Error::config_invalid(
            "sealed envelope does not have four dot-separated fields",
        ));
    };
    if format!("{tag}.{header}") != SEALED_HEADER || *signature != SEALED_SIGNATURE {
        return Err(Error::config_invalid("sealed envelope markers are malformed"));
    }
    let json = BASE64_URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| Error::config_invalid(format!("sealed envelope body: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| Error::config_invalid(format!("sealed envelope body: {e}")))
}

/// Name of the synthetic Secret that replaces `original`.
pub fn sealed_name(original: &str) -> String {
    format!("sealed-{original}")
}

/// Synthetic Secret carrying one sealed envelope per key of the
/// original, under the original key names so mounts and env vars keep
/// working.
pub fn sealed_secret_document(secret: &ResolvedSecret) -> Result<(String, Value)> {
    let new_name = sealed_name(&secret.name);
    let mut string_data = BTreeMap::new();
    for key in &secret.keys {
        let uri = format!(
            "kbs:///{}/{}/{}",
            secret.namespace,
            secret.name,
            canonical_key(key)
        );
        string_data.insert(key.clone(), seal_uri(&uri)?);
    }
    let doc = Secret {
        metadata: ObjectMeta {
            name: Some(new_name.clone()),
            namespace: Some(secret.namespace.clone()),
            ..Default::default()
        },
        string_data: Some(string_data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    Ok((new_name, typed_to_document(&doc)?))
}

/// Sealed replacements for every regular secret: the substitution map
/// (original name to sealed name) plus the documents to write.
pub fn sealed_documents(
    secrets: &[ResolvedSecret],
) -> Result<(BTreeMap<String, String>, Vec<Value>)> {
    let mut substitutions = BTreeMap::new();
    let mut docs = Vec::new();
    for secret in secrets {
        let (new_name, doc) = sealed_secret_document(secret)?;
        substitutions.insert(secret.name.clone(), new_name);
        docs.push(doc);
    }
    Ok((substitutions, docs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct TestCluster {
        secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
        pull_secrets: Vec<String>,
        offline: bool,
    }

    impl TestCluster {
        fn online() -> Self {
            Self {
                secrets: BTreeMap::new(),
                pull_secrets: Vec::new(),
                offline: false,
            }
        }

        fn offline() -> Self {
            Self {
                secrets: BTreeMap::new(),
                pull_secrets: Vec::new(),
                offline: true,
            }
        }

        fn with_secret(mut self, namespace: &str, name: &str, keys: &[(&str, &str)]) -> Self {
            self.secrets.insert(
                (namespace.to_string(), name.to_string()),
                keys.iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
            );
            self
        }
    }

    impl ClusterInspector for TestCluster {
        fn available(&self) -> bool {
            !self.offline
        }

        async fn secret_data(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
            if self.offline {
                return Err(Error::SecretClusterUnreachable {
                    references: Vec::new(),
                    reason: "no route to host".to_string(),
                });
            }
            Ok(self
                .secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn service_account_pull_secrets(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Vec<String>> {
            if self.offline {
                return Err(Error::SecretClusterUnreachable {
                    references: Vec::new(),
                    reason: "no route to host".to_string(),
                });
            }
            Ok(self.pull_secrets.clone())
        }

        async fn node_addresses(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn current_namespace(&self) -> Option<String> {
            None
        }
    }

    fn env_from_ref(name: &str) -> SecretRef {
        let mut reference = SecretRef::new(name);
        reference.record(
            SecretUsage::EnvFrom {
                container: "app".to_string(),
            },
            [],
            true,
        );
        reference
    }

    #[test]
    fn envelope_has_four_parts_and_snake_case_settings() {
        let sealed = seal_uri("kbs:///default/db/url").unwrap();
        let parts: Vec<&str> = sealed.split('.').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "sealed");
        assert_eq!(parts[1], "fakejwsheader");
        assert_eq!(parts[3], "fakesignature");

        let json = BASE64_URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        let rendered = String::from_utf8(json).unwrap();
        assert!(rendered.contains("\"provider_settings\""));
        assert!(!rendered.contains("providerSettings"));
        assert!(rendered.contains("\"provider\":\"kbs\""));
    }

    #[test]
    fn unseal_round_trips_the_uri() {
        let uri = "kbs:///prod/db/password";
        let body = unseal(&seal_uri(uri).unwrap()).unwrap();
        assert_eq!(body.name, uri);
        assert_eq!(body.version, "0.1.0");
        assert_eq!(body.type_, "vault");
    }

    #[test]
    fn canonical_keys_drop_dots_and_map_dockercfg() {
        assert_eq!(canonical_key(".dockerconfigjson"), "dockerconfigjson");
        assert_eq!(canonical_key(".dockercfg"), "dockerconfigjson");
        assert_eq!(canonical_key("tls.crt"), "tls.crt");
        assert_eq!(canonical_key("password"), "password");
    }

    #[test]
    fn sealed_documents_build_a_substitution_map() {
        let resolved = ResolvedSecret {
            name: "db".to_string(),
            namespace: "prod".to_string(),
            keys: vec!["pw".to_string(), "url".to_string()],
            values: BTreeMap::new(),
            usages: Vec::new(),
        };
        let (map, docs) = sealed_documents(&[resolved]).unwrap();
        assert_eq!(map.get("db"), Some(&"sealed-db".to_string()));
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(
            doc["metadata"]["name"],
            Value::String("sealed-db".to_string())
        );
        assert_eq!(doc["metadata"]["namespace"], Value::String("prod".to_string()));
        let pw = doc["stringData"]["pw"].as_str().unwrap();
        let body = unseal(pw).unwrap();
        assert_eq!(body.name, "kbs:///prod/db/pw");
    }

    #[tokio::test]
    async fn inline_keys_skip_the_cluster_in_plan_mode() {
        let mut reference = SecretRef::new("db");
        reference.record(
            SecretUsage::Volume {
                volume_name: "creds".to_string(),
                items: Some(vec!["url".to_string()]),
            },
            ["url".to_string()],
            false,
        );
        let cluster = TestCluster::offline();
        let inspected = inspect(vec![reference], "default", false, &cluster)
            .await
            .unwrap();
        assert_eq!(inspected.regular.len(), 1);
        assert_eq!(inspected.regular[0].keys, vec!["url".to_string()]);
        assert!(inspected.regular[0].values.is_empty());
    }

    #[tokio::test]
    async fn lookup_against_an_offline_cluster_names_the_references() {
        let cluster = TestCluster::offline();
        let err = inspect(vec![env_from_ref("envfrom-secret")], "default", false, &cluster)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretClusterUnreachable);
        let rendered = err.to_string();
        assert!(rendered.contains("envfrom-secret (envFrom)"));
    }

    #[tokio::test]
    async fn lookup_enumerates_keys_from_the_cluster() {
        let cluster = TestCluster::online().with_secret(
            "default",
            "envfrom-secret",
            &[("A", "1"), ("B", "2")],
        );
        let inspected = inspect(vec![env_from_ref("envfrom-secret")], "default", false, &cluster)
            .await
            .unwrap();
        assert_eq!(
            inspected.regular[0].keys,
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_secret_data_fails_the_lookup() {
        let cluster = TestCluster::online().with_secret("default", "app-env", &[]);
        let err = inspect(vec![env_from_ref("app-env")], "default", false, &cluster)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretQueryFailed);
        assert!(err.to_string().contains("no data keys"));
    }

    #[tokio::test]
    async fn missing_secret_is_its_own_failure() {
        let cluster = TestCluster::online();
        let err = inspect(vec![env_from_ref("absent")], "default", false, &cluster)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecretNotFound);
        assert!(err.to_string().contains("absent"));
    }

    #[tokio::test]
    async fn service_account_fallback_adds_pull_secrets() {
        let mut cluster = TestCluster::online().with_secret(
            "default",
            "regcred",
            &[(".dockerconfigjson", "{}")],
        );
        cluster.pull_secrets = vec!["regcred".to_string()];
        let inspected = inspect(Vec::new(), "default", true, &cluster).await.unwrap();
        assert_eq!(inspected.image_pull.len(), 1);
        assert_eq!(inspected.image_pull[0].name, "regcred");
        assert_eq!(
            inspected.image_pull[0].keys,
            vec![".dockerconfigjson".to_string()]
        );
        assert!(!inspected.image_pull[0].values.is_empty());
    }
}
