//! End-to-end conversions against in-memory cluster, KBS, and apply
//! fakes, checking the files a run leaves behind and the order of its
//! side effects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use serde_yaml::Value;

use coco::cluster::ClusterInspector;
use coco::config::Config;
use coco::convert::{self, ConvertOptions, ConvertReport, INIT_CONTAINER_NAME};
use coco::error::{Error, ErrorKind, Result};
use coco::initdata::{self, INITDATA_ANNOTATION};
use coco::kbs::{KbsRepository, KbsTransport, NoTransport};
use coco::kubectl::{ApplyDriver, NoApply};
use coco::secrets;
use coco::sidecar::{SanOptions, SIDECAR_CONTAINER_NAME};
use coco::tls;

#[derive(Default)]
struct FakeCluster {
    secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    pull_secrets: Vec<String>,
    nodes: Vec<String>,
    context_namespace: Option<String>,
    offline: bool,
}

impl FakeCluster {
    fn online() -> Self {
        Self::default()
    }

    fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    fn with_secret(mut self, namespace: &str, name: &str, entries: &[(&str, &[u8])]) -> Self {
        self.secrets.insert(
            (namespace.to_string(), name.to_string()),
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        );
        self
    }

    fn with_nodes(mut self, nodes: &[&str]) -> Self {
        self.nodes = nodes.iter().map(|n| n.to_string()).collect();
        self
    }

    fn unreachable() -> Error {
        Error::SecretClusterUnreachable {
            references: Vec::new(),
            reason: "connection refused".to_string(),
        }
    }
}

impl ClusterInspector for FakeCluster {
    fn available(&self) -> bool {
        !self.offline
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        if self.offline {
            return Err(Self::unreachable());
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
            return Err(Self::unreachable());
        }
        Ok(self.pull_secrets.clone())
    }

    async fn node_addresses(&self) -> Result<Vec<String>> {
        if self.offline {
            return Err(Self::unreachable());
        }
        Ok(self.nodes.clone())
    }

    fn current_namespace(&self) -> Option<String> {
        self.context_namespace.clone()
    }
}

#[derive(Default)]
struct RecordingTransport {
    uploads: Mutex<Vec<(String, BTreeMap<String, Vec<u8>>)>>,
}

impl RecordingTransport {
    fn uploads(&self) -> Vec<(String, BTreeMap<String, Vec<u8>>)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl KbsTransport for RecordingTransport {
    async fn wait_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, namespace: &str, repository: &KbsRepository) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((namespace.to_string(), repository.files().clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingApply {
    applies: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingApply {
    fn applies(&self) -> Vec<(PathBuf, String)> {
        self.applies.lock().unwrap().clone()
    }
}

impl ApplyDriver for RecordingApply {
    async fn apply(&self, file: &Path, namespace: &str) -> Result<()> {
        self.applies
            .lock()
            .unwrap()
            .push((file.to_path_buf(), namespace.to_string()));
        Ok(())
    }
}

fn test_config() -> Config {
    Config {
        trustee_server: "https://kbs.coco-kbs.svc.cluster.local:8080".to_string(),
        ..Default::default()
    }
}

fn options(dir: &Path, file: &str) -> ConvertOptions {
    ConvertOptions {
        filename: dir.join(file),
        load_root: dir.to_path_buf(),
        namespace: None,
        convert_secrets: false,
        add_init_container: false,
        apply: false,
        initdata: true,
        sidecar_sans: SanOptions::default(),
        cert_dir: dir.join("certs"),
    }
}

async fn write_manifest(dir: &Path, file: &str, contents: &str) {
    tokio::fs::write(dir.join(file), contents).await.unwrap();
}

fn read_documents(path: &Path) -> Vec<Value> {
    let raw = std::fs::read_to_string(path).unwrap();
    serde_yaml::Deserializer::from_str(&raw)
        .map(|doc| Value::deserialize(doc).unwrap())
        .collect()
}

fn file_names(report: &ConvertReport) -> Vec<String> {
    report
        .files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect()
}

#[tokio::test]
async fn plain_pod_gets_runtime_class_and_initdata() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "pod.yaml",
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: simple
spec:
  containers:
    - name: app
      image: nginx
"#,
    )
    .await;

    let report = convert::run(
        &options(dir.path(), "pod.yaml"),
        &test_config(),
        &FakeCluster::online(),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap();

    assert_eq!(report.workload, "simple");
    assert_eq!(report.kind, "Pod");
    assert_eq!(report.namespace, "default");
    assert_eq!(report.runtime_class, "kata-cc");
    assert!(!report.applied);
    assert!(report.warnings.is_empty());
    assert_eq!(file_names(&report), vec!["pod-coco.yaml".to_string()]);

    let docs = read_documents(&report.files[0]);
    assert_eq!(docs.len(), 1);
    let pod = &docs[0];
    assert_eq!(
        pod["spec"]["runtimeClassName"],
        Value::String("kata-cc".to_string())
    );
    let annotation = pod["metadata"]["annotations"][INITDATA_ANNOTATION]
        .as_str()
        .unwrap();
    let files = initdata::decode_annotation(annotation).unwrap();
    assert_eq!(
        files.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["aa.toml", "cdh.toml", "policy.rego"]
    );
}

#[tokio::test]
async fn inline_secret_references_are_sealed_without_cluster_access() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "db-client.yaml",
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: db-client
  namespace: prod
spec:
  containers:
    - name: app
      image: nginx
      env:
        - name: DB_URL
          valueFrom:
            secretKeyRef:
              name: db
              key: url
  volumes:
    - name: creds
      secret:
        secretName: db
        items:
          - key: pw
"#,
    )
    .await;

    let mut options = options(dir.path(), "db-client.yaml");
    options.convert_secrets = true;

    let report = convert::run(
        &options,
        &test_config(),
        &FakeCluster::offline(),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap();

    assert_eq!(report.namespace, "prod");
    assert_eq!(
        report.replaced_secrets,
        BTreeMap::from([("db".to_string(), "sealed-db".to_string())])
    );
    assert_eq!(
        file_names(&report),
        vec![
            "db-client-coco.yaml".to_string(),
            "db-client-sealed-secrets.yaml".to_string(),
            "db-client-trustee-secrets.yaml".to_string(),
        ]
    );

    // Both references now point at the sealed replacement.
    let pod = &read_documents(&report.files[0])[0];
    assert_eq!(
        pod["spec"]["containers"][0]["env"][0]["valueFrom"]["secretKeyRef"]["name"],
        Value::String("sealed-db".to_string())
    );
    assert_eq!(
        pod["spec"]["volumes"][0]["secret"]["secretName"],
        Value::String("sealed-db".to_string())
    );

    // One replacement Secret with one envelope per key.
    let sealed = read_documents(&report.files[1]);
    assert_eq!(sealed.len(), 1);
    let secret = &sealed[0];
    assert_eq!(
        secret["metadata"]["name"],
        Value::String("sealed-db".to_string())
    );
    assert_eq!(
        secret["metadata"]["namespace"],
        Value::String("prod".to_string())
    );
    let pw = secrets::unseal(secret["stringData"]["pw"].as_str().unwrap()).unwrap();
    assert_eq!(pw.name, "kbs:///prod/db/pw");
    let url = secrets::unseal(secret["stringData"]["url"].as_str().unwrap()).unwrap();
    assert_eq!(url.name, "kbs:///prod/db/url");

    // Plan mode stages nothing, so every target is undigested.
    assert_eq!(report.kbs_targets.len(), 2);
    assert!(report.kbs_targets.iter().all(|t| t.sha256.is_none()));
    let listing = std::fs::read_to_string(&report.files[2]).unwrap();
    assert!(listing.contains("prod/db/pw"));
    assert!(listing.contains("prod/db/url"));
    assert!(listing.contains("https://kbs.coco-kbs.svc.cluster.local:8080"));
}

#[tokio::test]
async fn env_from_requires_the_cluster_and_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "web.yaml",
        r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: app
          image: nginx
          envFrom:
            - secretRef:
                name: app-env
"#,
    )
    .await;

    let mut options = options(dir.path(), "web.yaml");
    options.convert_secrets = true;

    let err = convert::run(
        &options,
        &test_config(),
        &FakeCluster::offline(),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SecretClusterUnreachable);
    let rendered = err.to_string();
    assert!(rendered.contains("app-env (envFrom)"));
    assert!(rendered.contains("inline item keys"));
    // The failure precedes every write.
    assert!(!dir.path().join("web-coco.yaml").exists());
    assert!(!dir.path().join("web-sealed-secrets.yaml").exists());
}

#[tokio::test]
async fn sidecar_injection_writes_service_and_tls_companions() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "web.yaml",
        r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: app
          image: nginx
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 80
      targetPort: 8080
"#,
    )
    .await;

    let cert_dir = dir.path().join("certs");
    let ca = tls::generate_ca("test-ca").unwrap();
    tls::save(&ca, &cert_dir, tls::CA_FILE_BASE).await.unwrap();

    let mut config = test_config();
    config.sidecar.enabled = true;

    let report = convert::run(
        &options(dir.path(), "web.yaml"),
        &config,
        &FakeCluster::online().with_nodes(&["198.51.100.4"]),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap();

    assert!(report.warnings.is_empty());
    assert_eq!(
        file_names(&report),
        vec![
            "web-coco.yaml".to_string(),
            "web-sidecar-service.yaml".to_string(),
            "web-sidecar-tls.yaml".to_string(),
            "web-trustee-secrets.yaml".to_string(),
        ]
    );

    // Converted output keeps the companion Service from the input.
    let docs = read_documents(&report.files[0]);
    assert_eq!(docs.len(), 2);
    let containers = docs[0]["spec"]["template"]["spec"]["containers"]
        .as_sequence()
        .unwrap();
    assert_eq!(containers.len(), 2);
    let sidecar = &containers[1];
    assert_eq!(
        sidecar["name"],
        Value::String(SIDECAR_CONTAINER_NAME.to_string())
    );
    let env = sidecar["env"].as_sequence().unwrap();
    let env_value = |name: &str| -> Option<String> {
        env.iter()
            .find(|e| e["name"].as_str() == Some(name))
            .and_then(|e| e["value"].as_str().map(str::to_string))
    };
    assert_eq!(env_value("FORWARD_PORT"), Some("8080".to_string()));
    assert_eq!(env_value("HTTPS_PORT"), Some("8443".to_string()));
    assert_eq!(
        env_value("TLS_CERT_URI"),
        Some("kbs:///default/sidecar-tls-web/server-cert".to_string())
    );

    let service = &read_documents(&report.files[1])[0];
    assert_eq!(service["kind"], Value::String("Service".to_string()));
    assert_eq!(
        service["metadata"]["name"],
        Value::String("web-sidecar".to_string())
    );
    assert_eq!(
        service["spec"]["selector"]["app"],
        Value::String("web".to_string())
    );

    let tls_secret = &read_documents(&report.files[2])[0];
    assert_eq!(
        tls_secret["type"],
        Value::String("kubernetes.io/tls".to_string())
    );
    assert_eq!(
        tls_secret["metadata"]["name"],
        Value::String("sidecar-tls-web".to_string())
    );
    assert!(tls_secret["data"]["tls.crt"].as_str().is_some());

    let paths: Vec<&str> = report.kbs_targets.iter().map(|t| t.path.as_str()).collect();
    assert!(paths.contains(&"default/sidecar-tls-web/server-cert"));
    assert!(paths.contains(&"default/sidecar-tls-web/server-key"));
    assert!(paths.contains(&"default/sidecar-tls/client-ca"));
    assert!(report.kbs_targets.iter().all(|t| t.sha256.is_none()));
}

#[tokio::test]
async fn forward_port_clash_stops_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "web.yaml",
        r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: app
          image: nginx
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 8443
      targetPort: 8443
"#,
    )
    .await;

    let mut config = test_config();
    config.sidecar.enabled = true;

    // No CA exists; the conflict must be detected before certificate
    // loading is even attempted.
    let err = convert::run(
        &options(dir.path(), "web.yaml"),
        &config,
        &FakeCluster::online(),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PortConflict);
    assert!(!dir.path().join("web-coco.yaml").exists());
}

#[tokio::test]
async fn apply_mode_uploads_values_and_applies_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "pod.yaml",
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: shop
spec:
  imagePullSecrets:
    - name: regcred-a
    - name: regcred-b
  containers:
    - name: app
      image: registry.example.com/shop:1
      env:
        - name: DB_URL
          valueFrom:
            secretKeyRef:
              name: db
              key: url
"#,
    )
    .await;

    let cluster = FakeCluster::online()
        .with_secret("default", "db", &[("url", b"postgres://db")])
        .with_secret("default", "regcred-a", &[(".dockerconfigjson", b"{\"auths\":{}}")])
        .with_secret("default", "regcred-b", &[(".dockercfg", b"{}")]);
    let transport = RecordingTransport::default();
    let apply = RecordingApply::default();

    let mut options = options(dir.path(), "pod.yaml");
    options.convert_secrets = true;
    options.apply = true;

    let report = convert::run(&options, &test_config(), &cluster, &transport, &apply)
        .await
        .unwrap();

    assert!(report.applied);
    assert_eq!(
        report.replaced_secrets,
        BTreeMap::from([("db".to_string(), "sealed-db".to_string())])
    );
    // The second pull secret is uploaded but not wired into cdh.toml.
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("regcred-b"));

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    let (kbs_namespace, files) = &uploads[0];
    assert_eq!(kbs_namespace, "coco-kbs");
    assert_eq!(
        files.get("default/db/url"),
        Some(&b"postgres://db".to_vec())
    );
    // Legacy and modern docker config keys both land under the
    // canonical name.
    assert!(files.contains_key("default/regcred-a/dockerconfigjson"));
    assert!(files.contains_key("default/regcred-b/dockerconfigjson"));
    assert!(report.kbs_targets.iter().all(|t| t.sha256.is_some()));

    let pod = &read_documents(&report.files[0])[0];
    // Image-pull references stay on the original secrets.
    assert_eq!(
        pod["spec"]["imagePullSecrets"][0]["name"],
        Value::String("regcred-a".to_string())
    );
    assert_eq!(
        pod["spec"]["imagePullSecrets"][1]["name"],
        Value::String("regcred-b".to_string())
    );
    let annotation = pod["metadata"]["annotations"][INITDATA_ANNOTATION]
        .as_str()
        .unwrap();
    let init_files = initdata::decode_annotation(annotation).unwrap();
    assert!(init_files["cdh.toml"].contains("kbs:///default/regcred-a/dockerconfigjson"));
    assert!(!init_files["cdh.toml"].contains("regcred-b"));

    // Sealed secrets land before the workload that references them.
    let applies = apply.applies();
    assert_eq!(applies.len(), 2);
    assert!(applies[0].0.ends_with("pod-sealed-secrets.yaml"));
    assert!(applies[1].0.ends_with("pod-coco.yaml"));
    assert!(applies.iter().all(|(_, ns)| ns == "default"));
}

#[tokio::test]
async fn apply_mode_applies_the_sidecar_service_last() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "web.yaml",
        r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: app
          image: nginx
          env:
            - name: DB_URL
              valueFrom:
                secretKeyRef:
                  name: db
                  key: url
---
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  selector:
    app: web
  ports:
    - port: 80
      targetPort: 8080
"#,
    )
    .await;

    let cert_dir = dir.path().join("certs");
    let ca = tls::generate_ca("test-ca").unwrap();
    tls::save(&ca, &cert_dir, tls::CA_FILE_BASE).await.unwrap();

    let mut config = test_config();
    config.sidecar.enabled = true;

    let cluster = FakeCluster::online()
        .with_secret("default", "db", &[("url", b"postgres://db")])
        .with_nodes(&["198.51.100.4"]);
    let transport = RecordingTransport::default();
    let apply = RecordingApply::default();

    let mut options = options(dir.path(), "web.yaml");
    options.convert_secrets = true;
    options.apply = true;

    let report = convert::run(&options, &config, &cluster, &transport, &apply)
        .await
        .unwrap();

    // The sealed file stays behind as the record of what was applied;
    // the TLS Secret file is skipped because the material went to the
    // KBS instead.
    assert_eq!(
        file_names(&report),
        vec![
            "web-coco.yaml".to_string(),
            "web-sealed-secrets.yaml".to_string(),
            "web-sidecar-service.yaml".to_string(),
            "web-trustee-secrets.yaml".to_string(),
        ]
    );
    assert!(dir.path().join("web-sealed-secrets.yaml").exists());

    let applied: Vec<String> = apply
        .applies()
        .iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        applied,
        vec![
            "web-sealed-secrets.yaml".to_string(),
            "web-coco.yaml".to_string(),
            "web-sidecar-service.yaml".to_string(),
        ]
    );
}

#[tokio::test]
async fn namespace_flag_conflicting_with_manifest_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "pod.yaml",
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: simple
  namespace: prod
spec:
  containers:
    - name: app
      image: nginx
"#,
    )
    .await;

    let mut options = options(dir.path(), "pod.yaml");
    options.namespace = Some("staging".to_string());

    let err = convert::run(
        &options,
        &test_config(),
        &FakeCluster::online(),
        &NoTransport,
        &NoApply,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NamespaceConflict);
    let rendered = err.to_string();
    assert!(rendered.contains("staging"));
    assert!(rendered.contains("prod"));
    assert!(!dir.path().join("pod-coco.yaml").exists());
}

#[tokio::test]
async fn init_container_is_prepended_and_marker_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "pod.yaml",
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: simple
spec:
  initContainers:
    - name: migrate
      image: busybox
  containers:
    - name: app
      image: nginx
"#,
    )
    .await;

    let transport = RecordingTransport::default();
    let apply = RecordingApply::default();

    let mut options = options(dir.path(), "pod.yaml");
    options.add_init_container = true;
    options.apply = true;

    let report = convert::run(&options, &test_config(), &FakeCluster::online(), &transport, &apply)
        .await
        .unwrap();

    let pod = &read_documents(&report.files[0])[0];
    let init_containers = pod["spec"]["initContainers"].as_sequence().unwrap();
    assert_eq!(init_containers.len(), 2);
    assert_eq!(
        init_containers[0]["name"],
        Value::String(INIT_CONTAINER_NAME.to_string())
    );
    assert_eq!(
        init_containers[1]["name"],
        Value::String("migrate".to_string())
    );
    let command = init_containers[0]["command"].as_sequence().unwrap();
    assert_eq!(command[0], Value::String("/bin/sh".to_string()));
    assert!(command[2]
        .as_str()
        .unwrap()
        .contains("default/attestation-status/status"));

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(
        uploads[0].1.get("default/attestation-status/status"),
        Some(&b"attested".to_vec())
    );
    assert_eq!(report.kbs_targets.len(), 1);
    assert_eq!(report.kbs_targets[0].kind, "status");

    let applies = apply.applies();
    assert_eq!(applies.len(), 1);
    assert!(applies[0].0.ends_with("pod-coco.yaml"));
}
