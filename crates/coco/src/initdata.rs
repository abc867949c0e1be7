//! Builder for the guest init-data annotation.
//!
//! The Kata runtime passes the annotation value into the confidential
//! guest, where the attestation agent, the confidential data hub, and
//! the kata-agent read their configuration from it. The value is a
//! gzip-compressed TOML container document, base64-encoded.

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

/// Annotation key consumed by the Kata runtime.
pub const INITDATA_ANNOTATION: &str = "io.katacontainers.config.hypervisor.cc_init_data";

const INITDATA_VERSION: &str = "0.1.0";
const INITDATA_ALGORITHM: &str = "sha384";

/// Agent policy applied when the configuration names no policy file:
/// everything is allowed except exec and stream access into the guest.
const DEFAULT_AGENT_POLICY: &str = r#"package agent_policy

default AddARPNeighborsRequest := true
default AddSwapRequest := true
default CloseStdinRequest := true
default CopyFileRequest := true
default CreateContainerRequest := true
default CreateSandboxRequest := true
default DestroySandboxRequest := true
default GetMetricsRequest := true
default GetOOMEventRequest := true
default GuestDetailsRequest := true
default ListInterfacesRequest := true
default ListRoutesRequest := true
default MemHotplugByProbeRequest := true
default OnlineCPUMemRequest := true
default PauseContainerRequest := true
default PullImageRequest := true
default RemoveContainerRequest := true
default RemoveStaleVirtiofsShareMountsRequest := true
default ReseedRandomDevRequest := true
default ResumeContainerRequest := true
default SetGuestDateTimeRequest := true
default SetPolicyRequest := true
default SignalProcessRequest := true
default StartContainerRequest := true
default StartTracingRequest := true
default StatsContainerRequest := true
default StopTracingRequest := true
default TtyWinResizeRequest := true
default UpdateContainerRequest := true
default UpdateEphemeralMountsRequest := true
default UpdateInterfaceRequest := true
default UpdateRoutesRequest := true
default WaitProcessRequest := true

default ExecProcessRequest := false
default ReadStreamRequest := false
default WriteStreamRequest := false
"#;

/// Location of an uploaded image-pull secret, for wiring registry
/// credentials into the data hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePullSecretInfo {
    pub namespace: String,
    pub secret_name: String,
    pub key: String,
}

impl ImagePullSecretInfo {
    pub fn kbs_uri(&self) -> String {
        format!("kbs:///{}/{}/{}", self.namespace, self.secret_name, self.key)
    }
}

/// Outer container document embedding the per-component files.
#[derive(Debug, Serialize, Deserialize)]
struct InitData {
    version: String,
    algorithm: String,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct AaConfig<'a> {
    token_configs: TokenConfigs<'a>,
}

#[derive(Debug, Serialize)]
struct TokenConfigs<'a> {
    kbs: KbsTokenConfig<'a>,
}

#[derive(Debug, Serialize)]
struct KbsTokenConfig<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert: Option<String>,
}

#[derive(Debug, Serialize)]
struct CdhConfig<'a> {
    kbc: KbcConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<ImageConfig>,
}

#[derive(Debug, Serialize)]
struct KbcConfig<'a> {
    name: &'a str,
    url: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_security_policy_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authenticated_registry_credentials_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registry_configuration_uri: Option<String>,
}

impl ImageConfig {
    fn is_empty(&self) -> bool {
        self.image_security_policy_uri.is_none()
            && self.authenticated_registry_credentials_uri.is_none()
            && self.registry_configuration_uri.is_none()
    }
}

/// Assemble, compress, and encode the annotation value. Returns the
/// value plus any warnings raised while assembling.
pub fn build_annotation(
    config: &Config,
    image_pull_secrets: &[ImagePullSecretInfo],
) -> Result<(String, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut data = BTreeMap::new();
    data.insert("aa.toml".to_string(), aa_document(config)?);
    data.insert(
        "cdh.toml".to_string(),
        cdh_document(config, image_pull_secrets, &mut warnings)?,
    );
    data.insert("policy.rego".to_string(), policy_document(config)?);

    let container = InitData {
        version: INITDATA_VERSION.to_string(),
        algorithm: INITDATA_ALGORITHM.to_string(),
        data,
    };
    let rendered = toml::to_string(&container)
        .map_err(|e| Error::config_invalid(format!("failed to render init-data document: {e}")))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(rendered.as_bytes())
        .map_err(|e| gzip_error(&e))?;
    let compressed = encoder.finish().map_err(|e| gzip_error(&e))?;
    Ok((BASE64_STANDARD.encode(compressed), warnings))
}

/// Decode an annotation value back into the embedded file map.
pub fn decode_annotation(value: &str) -> Result<BTreeMap<String, String>> {
    let compressed = BASE64_STANDARD
        .decode(value)
        .map_err(|e| Error::config_invalid(format!("init-data annotation: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut rendered = String::new();
    decoder
        .read_to_string(&mut rendered)
        .map_err(|e| Error::config_invalid(format!("init-data annotation: {e}")))?;
    let container: InitData = toml::from_str(&rendered)
        .map_err(|e| Error::config_invalid(format!("init-data annotation: {e}")))?;
    Ok(container.data)
}

fn gzip_error(err: &std::io::Error) -> Error {
    Error::UploadFailed {
        target: "init-data annotation".to_string(),
        reason: err.to_string(),
    }
}

/// Attestation-agent configuration: where to fetch tokens, and which
/// certificate to trust for that connection.
fn aa_document(config: &Config) -> Result<String> {
    let document = AaConfig {
        token_configs: TokenConfigs {
            kbs: KbsTokenConfig {
                url: &config.trustee_server,
                cert: trustee_cert(config)?,
            },
        },
    };
    toml::to_string(&document)
        .map_err(|e| Error::config_invalid(format!("failed to render aa.toml: {e}")))
}

/// The configured trust anchor, accepted either inline as PEM or as a
/// path to a PEM file.
fn trustee_cert(config: &Config) -> Result<Option<String>> {
    let Some(value) = config.trustee_ca_cert.as_deref() else {
        return Ok(None);
    };
    if value.trim_start().starts_with("-----BEGIN") {
        return Ok(Some(value.to_string()));
    }
    std::fs::read_to_string(value)
        .map(Some)
        .map_err(|e| Error::config_invalid(format!("cannot read trustee_ca_cert '{value}': {e}")))
}

/// Confidential data hub configuration: the KBC endpoint plus optional
/// image-service URIs. When no registry credential URI is configured and
/// image-pull secrets were uploaded, the first one is wired in.
fn cdh_document(
    config: &Config,
    image_pull_secrets: &[ImagePullSecretInfo],
    warnings: &mut Vec<String>,
) -> Result<String> {
    let mut image = ImageConfig {
        image_security_policy_uri: config.container_policy_uri.clone(),
        authenticated_registry_credentials_uri: config.registry_cred_uri.clone(),
        registry_configuration_uri: config.registry_config_uri.clone(),
    };
    if image.authenticated_registry_credentials_uri.is_none() {
        if let Some(first) = image_pull_secrets.first() {
            if image_pull_secrets.len() > 1 {
                let skipped: Vec<&str> = image_pull_secrets[1..]
                    .iter()
                    .map(|info| info.secret_name.as_str())
                    .collect();
                warnings.push(format!(
                    "multiple image-pull secrets found; using '{}' for registry credentials \
                     and skipping {}",
                    first.secret_name,
                    skipped.join(", ")
                ));
            }
            image.authenticated_registry_credentials_uri = Some(first.kbs_uri());
        }
    }

    let document = CdhConfig {
        kbc: KbcConfig {
            name: "cc_kbc",
            url: &config.trustee_server,
        },
        image: if image.is_empty() { None } else { Some(image) },
    };
    toml::to_string(&document)
        .map_err(|e| Error::config_invalid(format!("failed to render cdh.toml: {e}")))
}

fn policy_document(config: &Config) -> Result<String> {
    match config.agent_policy_path.as_deref() {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            Error::config_invalid(format!("cannot read agent policy '{path}': {e}"))
        }),
        None => Ok(DEFAULT_AGENT_POLICY.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            trustee_server: "https://kbs.coco.svc.cluster.local:8080".to_string(),
            ..Default::default()
        }
    }

    fn pull(namespace: &str, name: &str) -> ImagePullSecretInfo {
        ImagePullSecretInfo {
            namespace: namespace.to_string(),
            secret_name: name.to_string(),
            key: "dockerconfigjson".to_string(),
        }
    }

    #[test]
    fn annotation_round_trips_three_documents() {
        let (value, warnings) = build_annotation(&test_config(), &[]).unwrap();
        assert!(warnings.is_empty());
        let files = decode_annotation(&value).unwrap();
        assert_eq!(
            files.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["aa.toml", "cdh.toml", "policy.rego"]
        );
        assert!(files["aa.toml"].contains("[token_configs.kbs]"));
        assert!(files["aa.toml"].contains("https://kbs.coco.svc.cluster.local:8080"));
        assert!(files["cdh.toml"].contains("cc_kbc"));
    }

    #[test]
    fn container_document_declares_version_and_digest() {
        let (value, _) = build_annotation(&test_config(), &[]).unwrap();
        let compressed = BASE64_STANDARD.decode(value).unwrap();
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut rendered = String::new();
        decoder.read_to_string(&mut rendered).unwrap();
        assert!(rendered.contains("version = \"0.1.0\""));
        assert!(rendered.contains("algorithm = \"sha384\""));
    }

    #[test]
    fn default_policy_blocks_exec_and_streams() {
        let (value, _) = build_annotation(&test_config(), &[]).unwrap();
        let files = decode_annotation(&value).unwrap();
        let policy = &files["policy.rego"];
        assert!(policy.contains("package agent_policy"));
        assert!(policy.contains("default ExecProcessRequest := false"));
        assert!(policy.contains("default ReadStreamRequest := false"));
        assert!(policy.contains("default WriteStreamRequest := false"));
        assert!(policy.contains("default CreateContainerRequest := true"));
    }

    #[test]
    fn first_pull_secret_becomes_the_registry_credential() {
        let pulls = vec![pull("default", "regcred-a"), pull("default", "regcred-b")];
        let (value, warnings) = build_annotation(&test_config(), &pulls).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("regcred-b"));

        let files = decode_annotation(&value).unwrap();
        let cdh = &files["cdh.toml"];
        assert!(cdh.contains("kbs:///default/regcred-a/dockerconfigjson"));
        assert!(!cdh.contains("regcred-b"));
    }

    #[test]
    fn configured_credential_uri_wins_over_pull_secrets() {
        let mut config = test_config();
        config.registry_cred_uri = Some("kbs:///default/custom/creds".to_string());
        let (value, warnings) = build_annotation(&config, &[pull("default", "regcred")]).unwrap();
        assert!(warnings.is_empty());
        let files = decode_annotation(&value).unwrap();
        assert!(files["cdh.toml"].contains("kbs:///default/custom/creds"));
        assert!(!files["cdh.toml"].contains("regcred"));
    }

    #[test]
    fn image_section_is_omitted_when_empty() {
        let (value, _) = build_annotation(&test_config(), &[]).unwrap();
        let files = decode_annotation(&value).unwrap();
        assert!(!files["cdh.toml"].contains("[image]"));
    }

    #[test]
    fn inline_pem_is_embedded_verbatim() {
        let mut config = test_config();
        config.trustee_ca_cert = Some("-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n".to_string());
        let (value, _) = build_annotation(&config, &[]).unwrap();
        let files = decode_annotation(&value).unwrap();
        assert!(files["aa.toml"].contains("BEGIN CERTIFICATE"));
    }
}
