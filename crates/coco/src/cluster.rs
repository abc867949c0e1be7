//! Read-only cluster access used by secret inspection and certificate
//! SAN auto-detection.
//!
//! Everything the pipeline asks of a cluster goes through
//! [`ClusterInspector`], so tests substitute in-memory fakes and the
//! pipeline stays oblivious to whether a kubeconfig was found.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Secret, ServiceAccount};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

/// Read-only cluster queries the pipeline depends on.
pub trait ClusterInspector {
    /// Whether queries can be attempted at all.
    fn available(&self) -> bool;

    /// Data of the named Secret, or `None` when it does not exist.
    fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<BTreeMap<String, Vec<u8>>>>>;

    /// Image-pull secret names attached to a service account.
    fn service_account_pull_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Vec<String>>>;

    /// Node addresses for certificate SANs: external addresses when any
    /// node has one, otherwise internal, deduplicated either way.
    fn node_addresses(&self) -> impl Future<Output = Result<Vec<String>>>;

    /// Namespace of the current client context, when known.
    fn current_namespace(&self) -> Option<String>;
}

/// Live inspector backed by the ambient kubeconfig or the in-cluster
/// environment.
#[derive(Clone)]
pub struct KubeInspector {
    client: Client,
}

impl KubeInspector {
    /// Build a client from the ambient configuration. This validates the
    /// configuration only; connection failures surface per query.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::SecretClusterUnreachable {
                references: Vec::new(),
                reason: format!("failed to construct a cluster client: {e}"),
            })?;
        Ok(Self { client })
    }
}

fn query_error(resource: String, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) => Error::SecretQueryFailed {
            resource,
            reason: response.message,
        },
        other => Error::SecretClusterUnreachable {
            references: Vec::new(),
            reason: other.to_string(),
        },
    }
}

impl ClusterInspector for KubeInspector {
    fn available(&self) -> bool {
        true
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| query_error(Error::secret_resource(name, namespace), e))?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn service_account_pull_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = api.get_opt(name).await.map_err(|e| {
            query_error(
                format!("service account '{name}' in namespace '{namespace}'"),
                e,
            )
        })?;
        Ok(pull_secret_names(account))
    }

    async fn node_addresses(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| query_error("nodes".to_string(), e))?;
        let addresses = preferred_addresses(&nodes.items);
        debug!(count = addresses.len(), "detected node addresses");
        Ok(addresses)
    }

    fn current_namespace(&self) -> Option<String> {
        Some(self.client.default_namespace().to_string())
    }
}

/// External addresses first; when no node has one, deduplicated internal
/// addresses. Order follows the node list, so identical cluster state
/// yields identical output.
fn preferred_addresses(nodes: &[Node]) -> Vec<String> {
    let mut external = Vec::new();
    let mut internal = Vec::new();
    for node in nodes {
        let addresses = node
            .status
            .iter()
            .flat_map(|status| status.addresses.iter().flatten());
        for address in addresses {
            match address.type_.as_str() {
                "ExternalIP" => push_unique(&mut external, &address.address),
                "InternalIP" => push_unique(&mut internal, &address.address),
                _ => {}
            }
        }
    }
    if external.is_empty() {
        internal
    } else {
        external
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

/// Names of the image-pull secrets attached to a service account.
fn pull_secret_names(account: Option<ServiceAccount>) -> Vec<String> {
    account
        .and_then(|account| account.image_pull_secrets)
        .unwrap_or_default()
        .into_iter()
        .map(|reference| reference.name)
        .collect()
}

/// Cluster access for one invocation: live when a client could be built,
/// otherwise a stub that fails lookups with the construction error.
pub enum ClusterAccess {
    Live(KubeInspector),
    Offline { reason: String },
}

impl ClusterAccess {
    /// Try to connect, falling back to the offline stub and remembering
    /// why. Plenty of invocations never touch the cluster, so this is
    /// not an error by itself.
    pub async fn detect() -> Self {
        match KubeInspector::connect().await {
            Ok(inspector) => ClusterAccess::Live(inspector),
            Err(Error::SecretClusterUnreachable { reason, .. }) => {
                debug!(%reason, "cluster client unavailable");
                ClusterAccess::Offline { reason }
            }
            Err(other) => {
                let reason = other.to_string();
                debug!(%reason, "cluster client unavailable");
                ClusterAccess::Offline { reason }
            }
        }
    }

    fn offline_error(&self) -> Error {
        let reason = match self {
            ClusterAccess::Offline { reason } => reason.clone(),
            ClusterAccess::Live(_) => "cluster is reachable".to_string(),
        };
        Error::SecretClusterUnreachable {
            references: Vec::new(),
            reason,
        }
    }
}

impl ClusterInspector for ClusterAccess {
    fn available(&self) -> bool {
        matches!(self, ClusterAccess::Live(_))
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        match self {
            ClusterAccess::Live(inspector) => inspector.secret_data(namespace, name).await,
            ClusterAccess::Offline { .. } => Err(self.offline_error()),
        }
    }

    async fn service_account_pull_secrets(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>> {
        match self {
            ClusterAccess::Live(inspector) => {
                inspector.service_account_pull_secrets(namespace, name).await
            }
            ClusterAccess::Offline { .. } => Err(self.offline_error()),
        }
    }

    async fn node_addresses(&self) -> Result<Vec<String>> {
        match self {
            ClusterAccess::Live(inspector) => inspector.node_addresses().await,
            ClusterAccess::Offline { .. } => Err(self.offline_error()),
        }
    }

    fn current_namespace(&self) -> Option<String> {
        match self {
            ClusterAccess::Live(inspector) => inspector.current_namespace(),
            ClusterAccess::Offline { .. } => None,
        }
    }
}
