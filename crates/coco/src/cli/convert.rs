use std::path::{Path, PathBuf};

use clap::Args;
use tracing::instrument;

use crate::cli::{CliCommand, CliContext, CommandOutput};
use crate::cluster::ClusterAccess;
use crate::config::{ConfigOverrides, SidecarOverrides};
use crate::convert::{self, ConvertOptions, ConvertReport};
use crate::kbs::NoTransport;
use crate::kubectl::{Kubectl, KubectlKbsTransport, NoApply};
use crate::sidecar::SanOptions;

/// Convert a workload manifest to run under a confidential runtime class
#[derive(Debug, Clone, Args)]
pub struct ConvertCommand {
    /// Path to the workload manifest to convert
    #[clap(name = "filename")]
    filename: PathBuf,

    /// Runtime class to schedule the converted workload under
    #[clap(long = "runtime-class")]
    runtime_class: Option<String>,

    /// Add an init container that blocks startup until attestation succeeds
    #[clap(long = "init-container")]
    init_container: bool,

    /// Image for the init container
    #[clap(long = "init-container-img", requires = "init_container")]
    init_container_img: Option<String>,

    /// Shell command the init container runs
    #[clap(long = "init-container-cmd", requires = "init_container")]
    init_container_cmd: Option<String>,

    /// Write conversion outputs without uploading or applying anything
    #[clap(long = "skip-apply")]
    skip_apply: bool,

    /// Leave the initdata annotation off the converted workload
    #[clap(long = "no-initdata")]
    no_initdata: bool,

    /// Path to a configuration file in a location other than the default
    #[clap(long = "config")]
    config: Option<PathBuf>,

    /// Directory holding the operator certificate authority
    #[clap(long = "cert-dir", env = "COCO_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Replace secret references with sealed secrets and upload their material
    #[clap(long = "convert-secrets")]
    convert_secrets: bool,

    /// Inject the secure-access TLS sidecar
    #[clap(long = "sidecar")]
    sidecar: bool,

    /// Sidecar container image
    #[clap(long = "sidecar-image")]
    sidecar_image: Option<String>,

    /// Comma-separated IP subject alternative names for the sidecar certificate
    #[clap(long = "sidecar-san-ips", value_delimiter = ',')]
    sidecar_san_ips: Vec<String>,

    /// Comma-separated DNS subject alternative names for the sidecar certificate
    #[clap(long = "sidecar-san-dns", value_delimiter = ',')]
    sidecar_san_dns: Vec<String>,

    /// Skip automatic node-address and service-name subject alternative names
    #[clap(long = "sidecar-skip-auto-sans")]
    sidecar_skip_auto_sans: bool,

    /// Port the sidecar forwards decrypted traffic to
    #[clap(long = "sidecar-port-forward")]
    sidecar_port_forward: Option<u16>,

    /// Namespace the workload is converted for
    #[clap(short = 'n', long = "namespace")]
    namespace: Option<String>,
}

impl ConvertCommand {
    fn overrides(&self) -> ConfigOverrides {
        let sidecar_touched =
            self.sidecar || self.sidecar_image.is_some() || self.sidecar_port_forward.is_some();
        ConfigOverrides {
            runtime_class: self.runtime_class.clone(),
            init_container_image: self.init_container_img.clone(),
            init_container_cmd: self.init_container_cmd.clone(),
            sidecar: sidecar_touched.then(|| SidecarOverrides {
                enabled: self.sidecar.then_some(true),
                image: self.sidecar_image.clone(),
                forward_port: self.sidecar_port_forward,
            }),
        }
    }
}

impl CliCommand for ConvertCommand {
    #[instrument(level = "debug", skip_all, name = "convert")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        let mut config = ctx.load_config(self.config.as_deref(), self.overrides())?;
        config.normalize()?;

        let load_root = self
            .filename
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let options = ConvertOptions {
            filename: self.filename.clone(),
            load_root,
            namespace: self.namespace.clone(),
            convert_secrets: self.convert_secrets,
            add_init_container: self.init_container,
            apply: !self.skip_apply,
            initdata: !self.no_initdata,
            sidecar_sans: SanOptions {
                ips: self.sidecar_san_ips.clone(),
                dns: self.sidecar_san_dns.clone(),
                skip_auto: self.sidecar_skip_auto_sans,
            },
            cert_dir: ctx.cert_dir(self.cert_dir.as_deref()),
        };

        let cluster = ClusterAccess::detect().await;
        let report = if options.apply {
            let kubectl = Kubectl::locate()?;
            let transport =
                KubectlKbsTransport::new(kubectl.clone(), config.trustee_server.clone());
            convert::run(&options, &config, &cluster, &transport, &kubectl).await?
        } else {
            convert::run(&options, &config, &cluster, &NoTransport, &NoApply).await?
        };

        let message = render_message(&report);
        let data = serde_json::to_value(&report)?;
        Ok(CommandOutput::ok(message, Some(data)))
    }
}

fn render_message(report: &ConvertReport) -> String {
    let mut out = format!(
        "Converted {} '{}' for runtime class '{}'.\n",
        report.kind, report.workload, report.runtime_class
    );
    out.push_str("Files written:\n");
    for file in &report.files {
        out.push_str(&format!("  {}\n", file.display()));
    }
    if !report.replaced_secrets.is_empty() {
        out.push_str("Replaced secret references:\n");
        for (old, new) in &report.replaced_secrets {
            out.push_str(&format!("  {old} -> {new}\n"));
        }
    }
    if !report.kbs_targets.is_empty() {
        out.push_str(if report.applied {
            "KBS resources uploaded:\n"
        } else {
            "KBS resources to upload:\n"
        });
        for target in &report.kbs_targets {
            out.push_str(&format!("  {} ({})\n", target.path, target.kind));
        }
    }
    if !report.warnings.is_empty() {
        out.push_str("Warnings:\n");
        for warning in &report.warnings {
            out.push_str(&format!("  {warning}\n"));
        }
    }
    if report.applied {
        out.push_str(&format!("Applied to namespace '{}'.", report.namespace));
    } else {
        out.push_str("Plan only; nothing was uploaded or applied.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::kbs::KbsTarget;

    #[test]
    fn message_covers_files_secrets_targets_and_warnings() {
        let report = ConvertReport {
            workload: "web".to_string(),
            kind: "Deployment".to_string(),
            namespace: "prod".to_string(),
            runtime_class: "kata-cc".to_string(),
            files: vec![PathBuf::from("web-coco.yaml")],
            kbs_targets: vec![KbsTarget {
                path: "prod/db/url".to_string(),
                kind: "secret-key".to_string(),
                sha256: None,
            }],
            replaced_secrets: BTreeMap::from([("db".to_string(), "sealed-db".to_string())]),
            warnings: vec!["something minor".to_string()],
            applied: false,
        };
        let message = render_message(&report);
        assert!(message.contains("Converted Deployment 'web'"));
        assert!(message.contains("web-coco.yaml"));
        assert!(message.contains("db -> sealed-db"));
        assert!(message.contains("prod/db/url (secret-key)"));
        assert!(message.contains("KBS resources to upload:"));
        assert!(message.contains("something minor"));
        assert!(message.contains("Plan only"));
    }

    #[test]
    fn sidecar_overrides_only_appear_when_flags_are_used() {
        let base = ConvertCommand {
            filename: PathBuf::from("pod.yaml"),
            runtime_class: None,
            init_container: false,
            init_container_img: None,
            init_container_cmd: None,
            skip_apply: true,
            no_initdata: false,
            config: None,
            cert_dir: None,
            convert_secrets: false,
            sidecar: false,
            sidecar_image: None,
            sidecar_san_ips: Vec::new(),
            sidecar_san_dns: Vec::new(),
            sidecar_skip_auto_sans: false,
            sidecar_port_forward: None,
            namespace: None,
        };
        assert!(base.overrides().sidecar.is_none());

        let with_image = ConvertCommand {
            sidecar_image: Some("quay.io/example/sidecar:2".to_string()),
            ..base.clone()
        };
        let overrides = with_image.overrides().sidecar.unwrap();
        // The image alone must not flip the enable switch.
        assert!(overrides.enabled.is_none());
        assert_eq!(overrides.image.as_deref(), Some("quay.io/example/sidecar:2"));

        let enabled = ConvertCommand {
            sidecar: true,
            ..base
        };
        assert_eq!(enabled.overrides().sidecar.unwrap().enabled, Some(true));
    }
}
