//! Contains the [Config] struct and related functions for managing coco
//! configuration, including loading, saving, and merging configurations
//! with explicit defaults.

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{Error, Result};
use crate::kbs::ATTESTATION_STATUS_PATH;

const ENV_PREFIX: &str = "COCO_";

/// Runtime class converted workloads are scheduled under unless
/// overridden.
pub const DEFAULT_RUNTIME_CLASS: &str = "kata-cc";
const DEFAULT_INIT_CONTAINER_IMAGE: &str = "registry.fedoraproject.org/fedora:latest";
/// Confidential data hub resource endpoint inside the pod sandbox,
/// polled by the default init container command.
const CDH_RESOURCE_ENDPOINT: &str = "http://127.0.0.1:8006/cdh/resource";
const DEFAULT_SIDECAR_IMAGE: &str = "quay.io/confidential-containers/coco-secure-access:latest";
const DEFAULT_HTTPS_PORT: u16 = 8443;

/// Conversion defaults, merged from the config file, `COCO_`-prefixed
/// environment variables, and command-line overrides (highest wins).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Trustee KBS endpoint, e.g. `https://kbs.coco-system.svc:8080`.
    /// Scheme-less values get `https://` prepended during validation.
    pub trustee_server: String,

    /// Runtime class name written into converted workloads.
    pub runtime_class: String,

    /// Trust anchor for the KBS connection, either inline PEM or a path
    /// to a PEM file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trustee_ca_cert: Option<String>,

    /// Kata agent policy file embedded into initdata in place of the
    /// built-in restrictive policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_policy_path: Option<String>,

    /// Image for the attestation-check init container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_container_image: Option<String>,

    /// Shell command for the attestation-check init container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_container_cmd: Option<String>,

    /// KBS image reference, read by the Trustee deployment tooling.
    /// The conversion pipeline itself never consumes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kbs_image: Option<String>,

    /// SGX/TDX provisioning certificate cache URL, read by the Trustee
    /// deployment tooling. The conversion pipeline itself never
    /// consumes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pccs_url: Option<String>,

    /// KBS URI of the container image security policy, wired into
    /// `cdh.toml` as `image_security_policy_uri`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_policy_uri: Option<String>,

    /// KBS URI of the registry credentials, wired into `cdh.toml` as
    /// `authenticated_registry_credentials_uri`. When unset, the first
    /// discovered image-pull secret takes its place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_cred_uri: Option<String>,

    /// KBS URI of the registry configuration, wired into `cdh.toml` as
    /// `registry_configuration_uri`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_config_uri: Option<String>,

    /// Extra pod-template annotations; entries with empty values are
    /// skipped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Secure-access sidecar settings.
    #[serde(default)]
    pub sidecar: SidecarConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trustee_server: String::new(),
            runtime_class: DEFAULT_RUNTIME_CLASS.to_string(),
            trustee_ca_cert: None,
            agent_policy_path: None,
            init_container_image: None,
            init_container_cmd: None,
            kbs_image: None,
            pccs_url: None,
            container_policy_uri: None,
            registry_cred_uri: None,
            registry_config_uri: None,
            annotations: BTreeMap::new(),
            sidecar: SidecarConfig::default(),
        }
    }
}

impl Config {
    /// Validate and canonicalize after merging: `trustee_server` must
    /// be set and parse as a URL once a missing scheme is defaulted to
    /// `https://`; `runtime_class` must be non-empty.
    pub fn normalize(&mut self) -> Result<()> {
        let trimmed = self.trustee_server.trim();
        if trimmed.is_empty() {
            return Err(Error::config_invalid(
                "trustee_server is not set; add it to the configuration file or set COCO_TRUSTEE_SERVER",
            ));
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        Url::parse(&with_scheme).map_err(|e| {
            Error::config_invalid(format!(
                "trustee_server '{with_scheme}' is not a valid URL: {e}"
            ))
        })?;
        self.trustee_server = with_scheme.trim_end_matches('/').to_string();

        if self.runtime_class.trim().is_empty() {
            return Err(Error::config_invalid("runtime_class must not be empty"));
        }
        Ok(())
    }

    pub fn init_container_image(&self) -> String {
        self.init_container_image
            .clone()
            .unwrap_or_else(|| DEFAULT_INIT_CONTAINER_IMAGE.to_string())
    }

    /// The init container command: poll the confidential data hub for
    /// the attestation readiness marker until it answers.
    pub fn init_container_cmd(&self) -> String {
        self.init_container_cmd.clone().unwrap_or_else(|| {
            format!(
                "until curl --fail --silent {CDH_RESOURCE_ENDPOINT}/{ATTESTATION_STATUS_PATH}; \
                 do sleep 2; done; echo attested"
            )
        })
    }
}

/// Secure-access sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidecarConfig {
    /// Inject the sidecar during conversion.
    pub enabled: bool,

    /// Sidecar container image.
    pub image: String,

    /// TLS listener port inside the pod.
    pub https_port: u16,

    /// Explicit KBS URI for the server certificate; derived per
    /// workload when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_uri: Option<String>,

    /// Explicit KBS URI for the server key; derived per workload when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_uri: Option<String>,

    /// Explicit KBS URI for the client CA; the shared operator CA path
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca_uri: Option<String>,

    /// Port the sidecar forwards decrypted traffic to; detected from a
    /// matching Service when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_port: Option<u16>,

    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,

    /// Skip certificate generation and upload; the operator manages the
    /// TLS material under the configured URIs.
    pub no_certs: bool,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
            https_port: DEFAULT_HTTPS_PORT,
            tls_cert_uri: None,
            tls_key_uri: None,
            client_ca_uri: None,
            forward_port: None,
            cpu_limit: "200m".to_string(),
            memory_limit: "128Mi".to_string(),
            cpu_request: "50m".to_string(),
            memory_request: "64Mi".to_string(),
            no_certs: false,
        }
    }
}

/// Command-line overrides layered on top of file and environment
/// configuration. `None` fields serialize to nothing, so they cannot
/// mask values from lower layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_container_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_container_cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<SidecarOverrides>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SidecarOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_port: Option<u16>,
}

/// Load configuration with hierarchical merging
/// Order of precedence (lowest to highest):
/// 1. Default values
/// 2. Config file (JSON)
/// 3. Environment variables (COCO_ prefix, `__` for nesting)
/// 4. Command line overrides
pub fn load_config(config_path: &Path, overrides: ConfigOverrides) -> Result<Config> {
    let mut figment = Figment::new();

    // Start with defaults
    figment = figment.merge(figment::providers::Serialized::defaults(Config::default()));

    if config_path.exists() {
        figment = figment.merge(Json::file(config_path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment = figment.merge(figment::providers::Serialized::defaults(overrides));

    figment
        .extract()
        .map_err(|e| Error::config_invalid(format!("failed to load configuration: {e}")))
}

/// Save configuration to specified path
pub async fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::file_write(parent, e))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| Error::config_invalid(format!("failed to serialize configuration: {e}")))?;

    tokio::fs::write(path, json)
        .await
        .map_err(|e| Error::file_write(path, e))
}

/// Generate a default configuration file with all explicit defaults
/// This is useful for `coco config init` command
pub async fn generate_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::config_invalid(format!(
            "configuration file already exists at {}; use --force to overwrite",
            path.display()
        )));
    }

    save_config(&Config::default(), path).await?;

    info!(config_path = %path.display(), "Generated default configuration");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    use figment::Jail;

    #[test]
    fn load_config_only_defaults() {
        Jail::expect_with(|_jail| {
            let config = load_config(Path::new("config.json"), ConfigOverrides::default())
                .map_err(|e| e.to_string())?;
            assert_eq!(config, Config::default());
            assert_eq!(config.runtime_class, DEFAULT_RUNTIME_CLASS);
            Ok(())
        });
    }

    #[test]
    fn load_config_merges_file_env_and_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.json",
                r#"{"trustee_server": "kbs.example.com", "runtime_class": "kata-file"}"#,
            )?;
            // Environment overrides the file.
            jail.set_env("COCO_RUNTIME_CLASS", "kata-env");
            jail.set_env("COCO_SIDECAR__HTTPS_PORT", "9443");

            let overrides = ConfigOverrides {
                init_container_image: Some("quay.io/example/attester:1".to_string()),
                ..Default::default()
            };
            let config =
                load_config(Path::new("config.json"), overrides).map_err(|e| e.to_string())?;
            assert_eq!(config.trustee_server, "kbs.example.com");
            assert_eq!(config.runtime_class, "kata-env");
            assert_eq!(config.sidecar.https_port, 9443);
            assert_eq!(
                config.init_container_image.as_deref(),
                Some("quay.io/example/attester:1")
            );
            Ok(())
        });
    }

    #[test]
    fn cli_overrides_win_over_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("COCO_RUNTIME_CLASS", "kata-env");
            jail.set_env("COCO_SIDECAR__IMAGE", "quay.io/example/env:1");

            let overrides = ConfigOverrides {
                runtime_class: Some("kata-flag".to_string()),
                sidecar: Some(SidecarOverrides {
                    enabled: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let config =
                load_config(Path::new("config.json"), overrides).map_err(|e| e.to_string())?;
            assert_eq!(config.runtime_class, "kata-flag");
            // Partial overrides leave sibling fields from lower layers.
            assert!(config.sidecar.enabled);
            assert_eq!(config.sidecar.image, "quay.io/example/env:1");
            Ok(())
        });
    }

    #[test]
    fn normalize_prepends_https_and_trims_trailing_slash() {
        let mut config = Config {
            trustee_server: "kbs.coco-system.svc:8080/".to_string(),
            ..Default::default()
        };
        config.normalize().unwrap();
        assert_eq!(config.trustee_server, "https://kbs.coco-system.svc:8080");

        let mut config = Config {
            trustee_server: "http://kbs.example.com".to_string(),
            ..Default::default()
        };
        config.normalize().unwrap();
        assert_eq!(config.trustee_server, "http://kbs.example.com");
    }

    #[test]
    fn normalize_rejects_missing_server_and_empty_runtime_class() {
        let mut config = Config::default();
        let err = config.normalize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("COCO_TRUSTEE_SERVER"));

        let mut config = Config {
            trustee_server: "https://kbs.example.com".to_string(),
            runtime_class: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.normalize().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[test]
    fn default_init_container_cmd_polls_the_attestation_marker() {
        let config = Config::default();
        let cmd = config.init_container_cmd();
        assert!(cmd.contains("http://127.0.0.1:8006/cdh/resource/default/attestation-status/status"));
        assert!(cmd.contains("until curl"));

        let config = Config {
            init_container_cmd: Some("true".to_string()),
            ..Default::default()
        };
        assert_eq!(config.init_container_cmd(), "true");
    }

    #[tokio::test]
    async fn generate_default_config_respects_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        generate_default_config(&path, false).await.unwrap();
        let err = generate_default_config(&path, false).await.unwrap_err();
        assert!(err.to_string().contains("--force"));
        generate_default_config(&path, true).await.unwrap();

        let saved: Config =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, Config::default());
    }
}
