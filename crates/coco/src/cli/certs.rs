use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Subcommand;
use serde_json::json;
use tracing::instrument;

use crate::cli::{CliCommand, CliContext, CommandOutput};
use crate::tls;

/// Name on the client certificate handed to operators for mutual TLS.
const CLIENT_CERT_CN: &str = "coco-operator";

#[derive(Subcommand, Debug, Clone)]
pub enum CertsCommand {
    /// Generate the certificate authority and operator client certificate
    #[clap(name = "init")]
    Init {
        /// Directory the certificates are written to
        #[clap(long = "cert-dir", env = "COCO_CERT_DIR")]
        cert_dir: Option<PathBuf>,

        /// Overwrite an existing certificate authority
        #[clap(long = "force")]
        force: bool,

        /// Common name on the certificate authority
        #[clap(long = "ca-cn", default_value = "coco-sidecar-ca")]
        ca_cn: String,
    },
}

impl CliCommand for CertsCommand {
    #[instrument(level = "debug", skip_all, name = "certs")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            CertsCommand::Init {
                cert_dir,
                force,
                ca_cn,
            } => {
                let dir = ctx.cert_dir(cert_dir.as_deref());
                let ca_cert_path = dir.join(format!("{}-cert.pem", tls::CA_FILE_BASE));
                if ca_cert_path.exists() && !force {
                    bail!(
                        "certificate authority already exists at {}; use --force to regenerate",
                        ca_cert_path.display()
                    );
                }

                let ca = tls::generate_ca(ca_cn).context("failed to generate the certificate authority")?;
                let (ca_cert, ca_key) = tls::save(&ca, &dir, tls::CA_FILE_BASE).await?;
                let client = tls::generate_client_cert(&ca, CLIENT_CERT_CN)
                    .context("failed to generate the operator client certificate")?;
                let (client_cert, client_key) =
                    tls::save(&client, &dir, tls::CLIENT_FILE_BASE).await?;

                let message = format!(
                    "Wrote certificate authority and client certificate to {}",
                    dir.display()
                );
                Ok(CommandOutput::ok(
                    message,
                    Some(json!({
                        "cert_dir": dir.display().to_string(),
                        "ca_cert": ca_cert.display().to_string(),
                        "ca_key": ca_key.display().to_string(),
                        "client_cert": client_cert.display().to_string(),
                        "client_key": client_key.display().to_string(),
                    })),
                ))
            }
        }
    }
}
