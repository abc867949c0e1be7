//! Schemaless model for Kubernetes workload documents.
//!
//! Manifests are held as [`serde_yaml::Value`] trees so that unknown
//! fields, vendor extensions, and future API versions survive a rewrite
//! byte-for-byte (up to YAML re-serialization). Typed lookups go through
//! [`Lookup`], which distinguishes a missing value from one with the
//! wrong shape instead of silently coercing.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use k8s_openapi::api::core::v1::Container;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::secrets::{SecretRef, SecretUsage};

/// All kinds the converter accepts as a primary workload.
pub const WORKLOAD_KINDS: &[&str] = &[
    "Pod",
    "Deployment",
    "StatefulSet",
    "ReplicaSet",
    "DaemonSet",
    "Job",
];

/// Upper bound on the raw size of a single YAML document.
const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
/// Upper bound on the number of documents per input file.
const MAX_DOCUMENTS: usize = 10;

/// Outcome of a typed lookup in a schemaless tree.
#[derive(Debug, PartialEq)]
pub enum Lookup<T> {
    /// The value exists with the expected shape.
    Found(T),
    /// Something exists along the path, but not with the expected shape.
    WrongShape {
        path: String,
        expected: &'static str,
    },
    /// Nothing exists at the path.
    Missing,
}

impl<T> Lookup<T> {
    /// Unwrap a lookup the document shape must guarantee.
    pub fn required(self, what: &str) -> Result<T> {
        match self {
            Lookup::Found(value) => Ok(value),
            Lookup::WrongShape { path, expected } => Err(Error::manifest_shape(format!(
                "{what}: '{path}' is not a {expected}"
            ))),
            Lookup::Missing => Err(Error::manifest_shape(format!("{what} is missing"))),
        }
    }

    /// Treat `Missing` as `None` while keeping shape mismatches fatal.
    pub fn optional(self) -> Result<Option<T>> {
        match self {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::WrongShape { path, expected } => Err(Error::manifest_shape(format!(
                "'{path}' is not a {expected}"
            ))),
            Lookup::Missing => Ok(None),
        }
    }
}

/// Walk `path` through nested mappings. Explicit nulls count as missing
/// because empty YAML sections parse to null.
fn lookup<'a>(root: &'a Value, path: &[&str]) -> Lookup<&'a Value> {
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        match node {
            Value::Null => return Lookup::Missing,
            Value::Mapping(map) => match map.get(*segment) {
                Some(next) => node = next,
                None => return Lookup::Missing,
            },
            _ => {
                return Lookup::WrongShape {
                    path: path[..depth].join("."),
                    expected: "mapping",
                }
            }
        }
    }
    Lookup::Found(node)
}

fn lookup_mut<'a>(root: &'a mut Value, path: &[&str]) -> Lookup<&'a mut Value> {
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        match node {
            Value::Null => return Lookup::Missing,
            Value::Mapping(map) => match map.get_mut(*segment) {
                Some(next) => node = next,
                None => return Lookup::Missing,
            },
            _ => {
                return Lookup::WrongShape {
                    path: path[..depth].join("."),
                    expected: "mapping",
                }
            }
        }
    }
    Lookup::Found(node)
}

fn as_mapping<'a>(value: &'a Value, path: &str) -> Result<&'a Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| Error::manifest_shape(format!("'{path}' is not a mapping")))
}

fn as_mapping_mut<'a>(value: &'a mut Value, path: &str) -> Result<&'a mut Mapping> {
    match value {
        Value::Mapping(map) => Ok(map),
        _ => Err(Error::manifest_shape(format!("'{path}' is not a mapping"))),
    }
}

fn as_str<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::manifest_shape(format!("'{path}' is not a string")))
}

/// Fetch or create a child mapping, replacing an explicit null.
fn ensure_child_mapping<'a>(map: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping> {
    let entry = map
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    as_mapping_mut(entry, key)
}

/// Fetch or create a child sequence, replacing an explicit null.
fn ensure_child_sequence<'a>(map: &'a mut Mapping, key: &str) -> Result<&'a mut Vec<Value>> {
    let entry = map
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if entry.is_null() {
        *entry = Value::Sequence(Vec::new());
    }
    match entry {
        Value::Sequence(seq) => Ok(seq),
        _ => Err(Error::manifest_shape(format!("'{key}' is not a sequence"))),
    }
}

/// One parsed Kubernetes document plus the identity fields every valid
/// resource carries.
#[derive(Debug, Clone)]
pub struct Manifest {
    doc: Value,
    source: PathBuf,
    kind: String,
    name: String,
    namespace: Option<String>,
}

impl Manifest {
    /// Validate the identity fields and wrap the document.
    pub fn from_value(doc: Value, source: impl Into<PathBuf>) -> Result<Self> {
        let source = source.into();
        if !doc.is_mapping() {
            return Err(Error::manifest_shape("document is not a mapping"));
        }
        let kind = as_str(lookup(&doc, &["kind"]).required("kind")?, "kind")?.to_string();
        let name = as_str(
            lookup(&doc, &["metadata", "name"]).required("metadata.name")?,
            "metadata.name",
        )?
        .to_string();
        let namespace = match lookup(&doc, &["metadata", "namespace"]).optional()? {
            Some(value) => Some(as_str(value, "metadata.namespace")?.to_string()),
            None => None,
        };
        Ok(Self {
            doc,
            source,
            kind,
            name,
            namespace,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_workload(&self) -> bool {
        WORKLOAD_KINDS.contains(&self.kind.as_str())
    }

    /// Where the pod spec lives for this kind.
    fn pod_spec_path(&self) -> &'static [&'static str] {
        if self.kind == "Pod" {
            &["spec"]
        } else {
            &["spec", "template", "spec"]
        }
    }

    fn require_workload(&self, what: &str) -> Result<()> {
        if self.is_workload() {
            Ok(())
        } else {
            Err(Error::manifest_shape(format!(
                "cannot {what}: kind '{}' is not a workload",
                self.kind
            )))
        }
    }

    fn pod_spec(&self, what: &str) -> Result<&Mapping> {
        self.require_workload(what)?;
        let path = self.pod_spec_path();
        as_mapping(lookup(&self.doc, path).required("pod spec")?, &path.join("."))
    }

    fn pod_spec_mut(&mut self, what: &str) -> Result<&mut Mapping> {
        self.require_workload(what)?;
        let path = self.pod_spec_path();
        let joined = path.join(".");
        as_mapping_mut(lookup_mut(&mut self.doc, path).required("pod spec")?, &joined)
    }

    /// Set `runtimeClassName` on the pod spec, leaving everything else
    /// untouched.
    pub fn set_runtime_class(&mut self, runtime_class: &str) -> Result<()> {
        let spec = self.pod_spec_mut("set the runtime class")?;
        spec.insert(
            Value::String("runtimeClassName".to_string()),
            Value::String(runtime_class.to_string()),
        );
        Ok(())
    }

    /// Set an annotation on the pod template metadata (document metadata
    /// for a bare Pod), creating the annotations mapping when absent.
    pub fn set_annotation(&mut self, key: &str, value: &str) -> Result<()> {
        self.require_workload("set an annotation")?;
        let template = if self.kind == "Pod" {
            as_mapping_mut(&mut self.doc, "document")?
        } else {
            let node = lookup_mut(&mut self.doc, &["spec", "template"]).required("pod template")?;
            as_mapping_mut(node, "spec.template")?
        };
        let metadata = ensure_child_mapping(template, "metadata")?;
        let annotations = ensure_child_mapping(metadata, "annotations")?;
        annotations.insert(
            Value::String(key.to_string()),
            Value::String(value.to_string()),
        );
        Ok(())
    }

    /// Prepend an init container so it runs before any existing ones.
    pub fn add_init_container(&mut self, name: &str, image: &str, cmd: &str) -> Result<()> {
        let container = Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                cmd.to_string(),
            ]),
            ..Default::default()
        };
        let value = serde_yaml::to_value(&container)
            .map_err(|e| Error::manifest_shape(format!("failed to render init container: {e}")))?;
        let spec = self.pod_spec_mut("add an init container")?;
        let list = ensure_child_sequence(spec, "initContainers")?;
        list.insert(0, value);
        Ok(())
    }

    /// Append a prebuilt container to the pod's container list.
    pub fn add_sidecar_container(&mut self, container: Value) -> Result<()> {
        let spec = self.pod_spec_mut("add a sidecar container")?;
        let list = match lookup_mut_map(spec, "containers") {
            Some(Value::Sequence(seq)) => seq,
            Some(_) => return Err(Error::manifest_shape("'containers' is not a sequence")),
            None => return Err(Error::manifest_shape("pod spec has no containers")),
        };
        list.push(container);
        Ok(())
    }

    /// Labels on the pod template metadata. Missing labels yield an
    /// empty map; non-string entries are a shape error.
    pub fn get_pod_labels(&self) -> Result<BTreeMap<String, String>> {
        self.require_workload("read pod labels")?;
        let path: &[&str] = if self.kind == "Pod" {
            &["metadata", "labels"]
        } else {
            &["spec", "template", "metadata", "labels"]
        };
        let mut labels = BTreeMap::new();
        if let Some(value) = lookup(&self.doc, path).optional()? {
            let map = as_mapping(value, "labels")?;
            for (key, value) in map {
                labels.insert(
                    as_str(key, "label key")?.to_string(),
                    as_str(value, "label value")?.to_string(),
                );
            }
        }
        Ok(labels)
    }

    /// Every secret referenced by the pod spec, coalesced by name across
    /// env, envFrom, volume, and imagePullSecret usages.
    pub fn get_secret_refs(&self) -> Result<Vec<SecretRef>> {
        let spec = self.pod_spec("collect secret references")?;
        let mut found: BTreeMap<String, SecretRef> = BTreeMap::new();

        for section in ["containers", "initContainers"] {
            let Some(containers) = optional_sequence(spec, section)? else {
                continue;
            };
            for container in containers {
                let container = as_mapping(container, section)?;
                let container_name =
                    as_str(mapping_get(container, "name", section)?, "container name")?;
                collect_env_refs(container, container_name, &mut found)?;
                collect_env_from_refs(container, container_name, &mut found)?;
            }
        }

        if let Some(volumes) = optional_sequence(spec, "volumes")? {
            for volume in volumes {
                collect_volume_refs(as_mapping(volume, "volumes")?, &mut found)?;
            }
        }

        if let Some(pull_secrets) = optional_sequence(spec, "imagePullSecrets")? {
            for entry in pull_secrets {
                let entry = as_mapping(entry, "imagePullSecrets")?;
                let name = as_str(
                    mapping_get(entry, "name", "imagePullSecrets")?,
                    "imagePullSecrets name",
                )?;
                record(&mut found, name, SecretUsage::ImagePullSecret, [], true);
            }
        }

        Ok(found.into_values().collect())
    }

    /// Rename every reference to `old` (env, envFrom, and volume secret
    /// names) to `new`. Image-pull references are deliberately left
    /// alone. Returns how many spots were updated.
    pub fn replace_secret_reference(&mut self, old: &str, new: &str) -> Result<usize> {
        let spec = self.pod_spec_mut("replace secret references")?;
        let mut replaced = 0;

        for section in ["containers", "initContainers"] {
            let Some(containers) = optional_sequence_mut(spec, section)? else {
                continue;
            };
            for container in containers {
                let container = as_mapping_mut(container, section)?;
                replaced += rename_env_refs(container, old, new)?;
                replaced += rename_env_from_refs(container, old, new)?;
            }
        }

        if let Some(volumes) = optional_sequence_mut(spec, "volumes")? {
            for volume in volumes {
                let volume = as_mapping_mut(volume, "volumes")?;
                if let Some(Value::Mapping(secret)) = lookup_mut_map(volume, "secret") {
                    if rename_string_field(secret, "secretName", old, new) {
                        replaced += 1;
                    }
                }
            }
        }

        debug!(old, new, replaced, "updated secret references");
        Ok(replaced)
    }

    /// Sibling path for the converted manifest: `<stem>-coco.yaml`.
    pub fn backup_path(&self) -> PathBuf {
        sibling_path(&self.source, "coco")
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// Serialize this single document to `path`.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let rendered = render_documents(std::slice::from_ref(&self.doc))?;
        tokio::fs::write(path, rendered)
            .await
            .map_err(|e| Error::file_write(path, e))
    }
}

/// Sibling path derived from an input file: `<stem>-<suffix>.yaml`.
pub fn sibling_path(source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifest".to_string());
    source.with_file_name(format!("{stem}-{suffix}.yaml"))
}

fn mapping_get<'a>(map: &'a Mapping, key: &str, context: &str) -> Result<&'a Value> {
    map.get(key)
        .ok_or_else(|| Error::manifest_shape(format!("{context} entry has no '{key}'")))
}

fn lookup_mut_map<'a>(map: &'a mut Mapping, key: &str) -> Option<&'a mut Value> {
    map.get_mut(key)
}

fn optional_sequence<'a>(map: &'a Mapping, key: &str) -> Result<Option<&'a Vec<Value>>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Sequence(seq)) => Ok(Some(seq)),
        Some(_) => Err(Error::manifest_shape(format!("'{key}' is not a sequence"))),
    }
}

fn optional_sequence_mut<'a>(map: &'a mut Mapping, key: &str) -> Result<Option<&'a mut Vec<Value>>> {
    match map.get_mut(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Sequence(seq)) => Ok(Some(seq)),
        Some(_) => Err(Error::manifest_shape(format!("'{key}' is not a sequence"))),
    }
}

fn record(
    found: &mut BTreeMap<String, SecretRef>,
    name: &str,
    usage: SecretUsage,
    keys: impl IntoIterator<Item = String>,
    needs_lookup: bool,
) {
    found
        .entry(name.to_string())
        .or_insert_with(|| SecretRef::new(name))
        .record(usage, keys, needs_lookup);
}

fn collect_env_refs(
    container: &Mapping,
    container_name: &str,
    found: &mut BTreeMap<String, SecretRef>,
) -> Result<()> {
    let Some(env) = optional_sequence(container, "env")? else {
        return Ok(());
    };
    for entry in env {
        let entry = as_mapping(entry, "env")?;
        let Lookup::Found(key_ref) = lookup_env_secret_ref(entry) else {
            continue;
        };
        let name = as_str(
            mapping_get(key_ref, "name", "secretKeyRef")?,
            "secretKeyRef name",
        )?;
        let key = as_str(
            mapping_get(key_ref, "key", "secretKeyRef")?,
            "secretKeyRef key",
        )?;
        let env_var = as_str(mapping_get(entry, "name", "env")?, "env name")?;
        record(
            found,
            name,
            SecretUsage::EnvVar {
                container: container_name.to_string(),
                env_var: env_var.to_string(),
            },
            [key.to_string()],
            false,
        );
    }
    Ok(())
}

fn lookup_env_secret_ref(entry: &Mapping) -> Lookup<&Mapping> {
    match entry.get("valueFrom") {
        Some(Value::Mapping(value_from)) => match value_from.get("secretKeyRef") {
            Some(Value::Mapping(key_ref)) => Lookup::Found(key_ref),
            Some(_) => Lookup::WrongShape {
                path: "secretKeyRef".to_string(),
                expected: "mapping",
            },
            None => Lookup::Missing,
        },
        _ => Lookup::Missing,
    }
}

fn collect_env_from_refs(
    container: &Mapping,
    container_name: &str,
    found: &mut BTreeMap<String, SecretRef>,
) -> Result<()> {
    let Some(env_from) = optional_sequence(container, "envFrom")? else {
        return Ok(());
    };
    for entry in env_from {
        let entry = as_mapping(entry, "envFrom")?;
        let Some(Value::Mapping(secret_ref)) = entry.get("secretRef") else {
            continue;
        };
        let name = as_str(
            mapping_get(secret_ref, "name", "secretRef")?,
            "secretRef name",
        )?;
        record(
            found,
            name,
            SecretUsage::EnvFrom {
                container: container_name.to_string(),
            },
            [],
            true,
        );
    }
    Ok(())
}

fn collect_volume_refs(volume: &Mapping, found: &mut BTreeMap<String, SecretRef>) -> Result<()> {
    let Some(Value::Mapping(secret)) = volume.get("secret") else {
        return Ok(());
    };
    let volume_name = as_str(mapping_get(volume, "name", "volumes")?, "volume name")?;
    let secret_name = as_str(
        mapping_get(secret, "secretName", "volume secret")?,
        "secretName",
    )?;
    let mut keys = Vec::new();
    let items = match optional_sequence(secret, "items")? {
        Some(items) => {
            for item in items {
                let item = as_mapping(item, "items")?;
                keys.push(as_str(mapping_get(item, "key", "items")?, "item key")?.to_string());
            }
            Some(keys.clone())
        }
        None => None,
    };
    record(
        found,
        secret_name,
        SecretUsage::Volume {
            volume_name: volume_name.to_string(),
            items,
        },
        keys,
        secret.get("items").is_none(),
    );
    Ok(())
}

fn rename_string_field(map: &mut Mapping, key: &str, old: &str, new: &str) -> bool {
    match map.get_mut(key) {
        Some(value) if value.as_str() == Some(old) => {
            *value = Value::String(new.to_string());
            true
        }
        _ => false,
    }
}

fn rename_env_refs(container: &mut Mapping, old: &str, new: &str) -> Result<usize> {
    let mut replaced = 0;
    let Some(env) = optional_sequence_mut(container, "env")? else {
        return Ok(0);
    };
    for entry in env {
        let entry = as_mapping_mut(entry, "env")?;
        let Some(Value::Mapping(value_from)) = entry.get_mut("valueFrom") else {
            continue;
        };
        let Some(Value::Mapping(key_ref)) = value_from.get_mut("secretKeyRef") else {
            continue;
        };
        if rename_string_field(key_ref, "name", old, new) {
            replaced += 1;
        }
    }
    Ok(replaced)
}

fn rename_env_from_refs(container: &mut Mapping, old: &str, new: &str) -> Result<usize> {
    let mut replaced = 0;
    let Some(env_from) = optional_sequence_mut(container, "envFrom")? else {
        return Ok(0);
    };
    for entry in env_from {
        let entry = as_mapping_mut(entry, "envFrom")?;
        let Some(Value::Mapping(secret_ref)) = entry.get_mut("secretRef") else {
            continue;
        };
        if rename_string_field(secret_ref, "name", old, new) {
            replaced += 1;
        }
    }
    Ok(replaced)
}

/// An input file's documents: exactly one primary workload plus any
/// companion documents (Services and the like) that ride along.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    docs: Vec<Manifest>,
    primary: usize,
}

impl ManifestSet {
    /// Read, split, and parse a manifest file. Remote URLs are refused
    /// and the path must stay inside `load_root`.
    pub async fn load(path: &Path, load_root: &Path) -> Result<Self> {
        let raw_path = path.to_string_lossy();
        if raw_path.starts_with("http://") || raw_path.starts_with("https://") {
            return Err(Error::NetworkBlocked {
                url: raw_path.to_string(),
            });
        }
        check_within_root(path, load_root)?;

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::yaml_invalid(path, e))?;
        let segments = split_documents(&raw);
        if segments.len() > MAX_DOCUMENTS {
            return Err(Error::DocumentTooLarge {
                path: path.display().to_string(),
                reason: format!("{} documents exceed the limit of {MAX_DOCUMENTS}", segments.len()),
            });
        }

        let mut docs = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            if segment.len() > MAX_DOCUMENT_BYTES {
                return Err(Error::DocumentTooLarge {
                    path: path.display().to_string(),
                    reason: format!(
                        "document {} is {} bytes, over the 10 MiB limit",
                        index + 1,
                        segment.len()
                    ),
                });
            }
            let value: Value = serde_yaml::from_str(segment)
                .map_err(|e| Error::yaml_invalid(path, e))?;
            docs.push(Manifest::from_value(value, path)?);
        }

        let primary = docs
            .iter()
            .position(Manifest::is_workload)
            .ok_or_else(|| {
                Error::manifest_shape(format!(
                    "no workload document found in '{}'; expected one of {WORKLOAD_KINDS:?}",
                    path.display()
                ))
            })?;
        debug!(
            documents = docs.len(),
            primary = %docs[primary].name(),
            kind = %docs[primary].kind(),
            "loaded manifest set"
        );
        Ok(Self { docs, primary })
    }

    pub fn primary(&self) -> &Manifest {
        &self.docs[self.primary]
    }

    pub fn primary_mut(&mut self) -> &mut Manifest {
        &mut self.docs[self.primary]
    }

    pub fn companions(&self) -> impl Iterator<Item = &Manifest> {
        let primary = self.primary;
        self.docs
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != primary)
            .map(|(_, m)| m)
    }

    /// Render every document in input order, the mutated primary
    /// included, as one multi-document stream.
    pub fn render(&self) -> Result<String> {
        let docs: Vec<Value> = self.docs.iter().map(|m| m.doc.clone()).collect();
        render_documents(&docs)
    }

    /// Resolve the numeric target port of the companion Service that
    /// selects the primary workload's pod labels. Named target ports are
    /// resolved against the primary's container ports. Returns the port
    /// (when one could be derived) plus any warnings raised on the way.
    pub fn derive_forward_port(&self) -> Result<(Option<u16>, Vec<String>)> {
        let mut warnings = Vec::new();
        let labels = self.primary().get_pod_labels()?;

        let mut matches = Vec::new();
        for companion in self.companions() {
            if companion.kind() != "Service" {
                continue;
            }
            let Some(selector) = lookup(companion.as_value(), &["spec", "selector"]).optional()?
            else {
                continue;
            };
            let selector = as_mapping(selector, "spec.selector")?;
            if selector.is_empty() {
                continue;
            }
            let selects = selector.iter().all(|(key, value)| {
                match (key.as_str(), value.as_str()) {
                    (Some(k), Some(v)) => labels.get(k).map(String::as_str) == Some(v),
                    _ => false,
                }
            });
            if selects {
                matches.push(companion);
            }
        }

        let service = match matches.as_slice() {
            [] => return Ok((None, warnings)),
            [one] => *one,
            [first, ..] => {
                warnings.push(format!(
                    "multiple Services select the workload; using '{}' for port detection",
                    first.name()
                ));
                *first
            }
        };

        let Some(ports) = lookup(service.as_value(), &["spec", "ports"]).optional()? else {
            return Ok((None, warnings));
        };
        let Some(port_entry) = ports.as_sequence().and_then(|s| s.first()) else {
            return Ok((None, warnings));
        };
        let port_entry = as_mapping(port_entry, "spec.ports")?;

        let resolved = match port_entry.get("targetPort") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(name)) => match self.container_port_by_name(name)? {
                Some(port) => Some(port),
                None => {
                    warnings.push(format!(
                        "Service '{}' targets port '{name}' which no container declares; \
                         falling back to the Service port",
                        service.name()
                    ));
                    port_number(port_entry)
                }
            },
            _ => port_number(port_entry),
        };

        match resolved.and_then(|p| u16::try_from(p).ok()) {
            Some(port) => Ok((Some(port), warnings)),
            None => Ok((None, warnings)),
        }
    }

    /// First container port whose name matches, scanning containers in
    /// declaration order.
    fn container_port_by_name(&self, target: &str) -> Result<Option<u64>> {
        let spec = self.primary().pod_spec("resolve a named port")?;
        let Some(containers) = optional_sequence(spec, "containers")? else {
            return Ok(None);
        };
        for container in containers {
            let container = as_mapping(container, "containers")?;
            let Some(ports) = optional_sequence(container, "ports")? else {
                continue;
            };
            for port in ports {
                let port = as_mapping(port, "ports")?;
                if port.get("name").and_then(Value::as_str) == Some(target) {
                    return Ok(port.get("containerPort").and_then(Value::as_u64));
                }
            }
        }
        Ok(None)
    }
}

fn port_number(entry: &Mapping) -> Option<u64> {
    entry.get("port").and_then(Value::as_u64)
}

/// kubectl-style document split: a line consisting of `---` separates
/// documents. Blank and comment-only segments are dropped.
fn split_documents(raw: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut segment_start = 0;
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        if line.trim_end() == "---" {
            segments.push(&raw[segment_start..offset]);
            segment_start = offset + line.len();
        }
        offset += line.len();
    }
    segments.push(&raw[segment_start..]);
    segments.retain(|segment| {
        segment
            .lines()
            .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
    });
    segments
}

/// Lexical containment check: after folding `.` and `..`, `path` must
/// stay under `root`. Works without touching the filesystem so it also
/// guards paths that do not exist yet.
fn check_within_root(path: &Path, root: &Path) -> Result<()> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize_lexically(&joined);
    let root_normalized = normalize_lexically(root);
    if normalized.starts_with(&root_normalized) {
        Ok(())
    } else {
        Err(Error::PathTraversal {
            path: path.display().to_string(),
            root: root.display().to_string(),
        })
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Render a typed resource as a full document. `k8s-openapi` types skip
/// `apiVersion` and `kind` during serialization, so they are prepended
/// from the type's constants.
pub(crate) fn typed_to_document<K>(resource: &K) -> Result<Value>
where
    K: k8s_openapi::Resource + Serialize,
{
    let mut doc = Mapping::new();
    doc.insert(
        Value::String("apiVersion".to_string()),
        Value::String(K::API_VERSION.to_string()),
    );
    doc.insert(
        Value::String("kind".to_string()),
        Value::String(K::KIND.to_string()),
    );
    let body = serde_yaml::to_value(resource).map_err(|e| {
        Error::manifest_shape(format!("failed to render {}: {e}", K::KIND))
    })?;
    if let Value::Mapping(fields) = body {
        for (key, value) in fields {
            doc.insert(key, value);
        }
    }
    Ok(Value::Mapping(doc))
}

/// Render documents into one multi-document YAML stream.
pub(crate) fn render_documents(docs: &[Value]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        if !out.is_empty() {
            out.push_str("---\n");
        }
        let rendered = serde_yaml::to_string(doc).map_err(|e| {
            Error::manifest_shape(format!("failed to render output document: {e}"))
        })?;
        out.push_str(&rendered);
    }
    Ok(out)
}
