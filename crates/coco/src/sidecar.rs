//! Secure-access sidecar construction: the injected container, its
//! companion Service, certificate URIs, and subject-alternative-name
//! assembly.
//!
//! The sidecar terminates mutual TLS inside the confidential pod and
//! forwards decrypted traffic to the workload port. It fetches its
//! certificate material from the KBS at startup, so the private key
//! only ever exists inside the attested guest.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, ResourceRequirements,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_yaml::Value;
use tracing::debug;

use crate::cluster::ClusterInspector;
use crate::config::SidecarConfig;
use crate::error::{Error, Result};
use crate::manifest::typed_to_document;

/// Name of the injected sidecar container.
pub const SIDECAR_CONTAINER_NAME: &str = "coco-secure-access";

/// KBS repository path of the shared client CA certificate. One
/// authority covers the whole cluster, so this does not vary per
/// workload or namespace.
pub const CLIENT_CA_PATH: &str = "default/sidecar-tls/client-ca";

/// KBS resource name holding one workload's server material.
pub fn tls_resource_name(workload: &str) -> String {
    format!("sidecar-tls-{workload}")
}

/// KBS URIs the sidecar reads its TLS material from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertUris {
    pub server_cert: String,
    pub server_key: String,
    pub client_ca: String,
}

/// Default URIs: server material is per workload and namespace, the
/// client CA is shared.
pub fn cert_uris(workload: &str, namespace: &str) -> CertUris {
    CertUris {
        server_cert: format!(
            "kbs:///{namespace}/{}/server-cert",
            tls_resource_name(workload)
        ),
        server_key: format!(
            "kbs:///{namespace}/{}/server-key",
            tls_resource_name(workload)
        ),
        client_ca: format!("kbs:///{CLIENT_CA_PATH}"),
    }
}

/// KBS repository paths (no scheme) of the uploaded server material.
pub fn server_cert_paths(workload: &str, namespace: &str) -> (String, String) {
    (
        format!("{namespace}/{}/server-cert", tls_resource_name(workload)),
        format!("{namespace}/{}/server-key", tls_resource_name(workload)),
    )
}

/// User inputs controlling the SAN set of the server certificate.
#[derive(Debug, Clone, Default)]
pub struct SanOptions {
    pub ips: Vec<String>,
    pub dns: Vec<String>,
    /// Skip node-address and service-name auto-detection.
    pub skip_auto: bool,
}

/// Union of user-supplied and auto-detected subject alternative names.
/// IP entries must parse; auto-detection failures downgrade to warnings.
pub async fn collect_sans<C: ClusterInspector>(
    options: &SanOptions,
    workload: &str,
    namespace: &str,
    cluster: &C,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>> {
    let mut sans: Vec<String> = Vec::new();
    for ip in &options.ips {
        let trimmed = ip.trim();
        let parsed: IpAddr = trimmed.parse().map_err(|_| {
            Error::config_invalid(format!(
                "'{trimmed}' is not a valid IP address for a subject alternative name"
            ))
        })?;
        push_unique(&mut sans, parsed.to_string());
    }
    for name in &options.dns {
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            push_unique(&mut sans, trimmed.to_string());
        }
    }
    if !options.skip_auto {
        match cluster.node_addresses().await {
            Ok(addresses) => {
                for address in addresses {
                    push_unique(&mut sans, address);
                }
            }
            Err(err) => warnings.push(format!(
                "could not auto-detect node addresses for certificate names: {err}"
            )),
        }
        push_unique(
            &mut sans,
            format!("{workload}.{namespace}.svc.cluster.local"),
        );
    }
    if sans.is_empty() {
        return Err(Error::CertMaterialMissing {
            reason: "no subject alternative names; pass --sidecar-san-ips or --sidecar-san-dns"
                .to_string(),
        });
    }
    debug!(count = sans.len(), "collected subject alternative names");
    Ok(sans)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Settle the forward port: an explicit request wins over detection, and
/// a clash with the HTTPS listener is fatal before anything is built.
pub fn resolve_forward_port(
    requested: Option<u16>,
    detected: Option<u16>,
    https_port: u16,
    warnings: &mut Vec<String>,
) -> Result<Option<u16>> {
    match requested.or(detected) {
        Some(port) if port == https_port => Err(Error::PortConflict { port }),
        Some(port) => Ok(Some(port)),
        None => {
            warnings.push(
                "no Service target port found; the sidecar will terminate TLS without forwarding"
                    .to_string(),
            );
            Ok(None)
        }
    }
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// Render the sidecar container as a schemaless fragment ready for
/// injection into a pod spec.
pub fn build_container(
    config: &SidecarConfig,
    forward_port: Option<u16>,
    uris: &CertUris,
) -> Result<Value> {
    let mut env = vec![
        env_value("TLS_CERT_URI", &uris.server_cert),
        env_value("TLS_KEY_URI", &uris.server_key),
        env_value("CLIENT_CA_URI", &uris.client_ca),
        env_value("HTTPS_PORT", config.https_port.to_string()),
    ];
    if let Some(port) = forward_port {
        env.push(env_value("FORWARD_PORT", port.to_string()));
    }
    env.push(downward_env("POD_NAME", "metadata.name"));
    env.push(downward_env("POD_NAMESPACE", "metadata.namespace"));

    let container = Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: i32::from(config.https_port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(quantities(&[
                ("cpu", &config.cpu_limit),
                ("memory", &config.memory_limit),
            ])),
            requests: Some(quantities(&[
                ("cpu", &config.cpu_request),
                ("memory", &config.memory_request),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };
    serde_yaml::to_value(&container)
        .map_err(|e| Error::manifest_shape(format!("failed to render sidecar container: {e}")))
}

/// ClusterIP Service exposing the sidecar's HTTPS port, selecting the
/// workload's pod labels (or `app: <workload>` when there are none).
pub fn build_service(
    workload: &str,
    namespace: &str,
    pod_labels: &BTreeMap<String, String>,
    https_port: u16,
) -> Result<Value> {
    let selector = if pod_labels.is_empty() {
        BTreeMap::from([("app".to_string(), workload.to_string())])
    } else {
        pod_labels.clone()
    };
    let service = Service {
        metadata: ObjectMeta {
            name: Some(format!("{workload}-sidecar")),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: i32::from(https_port),
                target_port: Some(IntOrString::Int(i32::from(https_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    typed_to_document(&service)
}
