use clap::Subcommand;
use etcetera::AppStrategy as _;
use serde_json::json;
use tracing::instrument;

use crate::cli::{CliCommand, CliContext, CommandOutput, CERT_DIR_NAME};
use crate::config::{generate_default_config, ConfigOverrides};

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Generate a default configuration file
    #[clap(name = "init")]
    Init {
        /// Overwrite an existing configuration file
        #[clap(long = "force")]
        force: bool,
    },
    /// Show where the CLI keeps its files
    #[clap(name = "info")]
    Info {},
    /// Print the effective configuration after all layers are merged
    #[clap(name = "show")]
    Show {},
}

impl CliCommand for ConfigCommand {
    #[instrument(level = "debug", skip_all, name = "config")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            ConfigCommand::Init { force } => {
                let path = ctx.config_path();
                generate_default_config(&path, *force).await?;
                Ok(CommandOutput::ok(
                    format!("Generated default configuration at {}", path.display()),
                    Some(json!({
                        "path": path.display().to_string(),
                    })),
                ))
            }
            ConfigCommand::Info {} => {
                let config_dir = ctx.config_dir();
                let config_path = ctx.config_path();
                let data_dir = ctx.data_dir();
                let cert_dir = ctx.cert_dir(None);
                let message = format!(
                    "coco {}\n\nConfig directory: {}\nConfig file: {}\nData directory: {}\nCertificate directory: {}",
                    crate::CARGO_PKG_VERSION,
                    config_dir.display(),
                    config_path.display(),
                    data_dir.display(),
                    cert_dir.display(),
                );
                Ok(CommandOutput::ok(
                    message,
                    Some(json!({
                        "version": crate::CARGO_PKG_VERSION,
                        "config_dir": config_dir.display().to_string(),
                        "config_file": config_path.display().to_string(),
                        "data_dir": data_dir.display().to_string(),
                        "cert_dir": cert_dir.display().to_string(),
                        "cert_dir_name": CERT_DIR_NAME,
                    })),
                ))
            }
            ConfigCommand::Show {} => {
                let config = ctx.load_config(None, ConfigOverrides::default())?;
                let rendered = serde_json::to_string_pretty(&config)?;
                let data = serde_json::to_value(&config)?;
                Ok(CommandOutput::ok(rendered, Some(data)))
            }
        }
    }
}
