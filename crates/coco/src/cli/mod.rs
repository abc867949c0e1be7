//! The main module for the coco CLI, providing command line interface functionality

use std::ops::Deref;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use etcetera::{AppStrategy as _, AppStrategyArgs, choose_app_strategy};

#[cfg(windows)]
use etcetera::app_strategy::Windows;
#[cfg(unix)]
use etcetera::app_strategy::Xdg;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use crate::config::{Config, ConfigOverrides, load_config};

pub mod certs;
pub mod config;
pub mod convert;

pub const CONFIG_FILE_NAME: &str = "config.json";
/// Subdirectory of the data dir holding the operator CA material.
pub const CERT_DIR_NAME: &str = "certs";

/// A trait that defines the interface for all CLI commands
pub trait CliCommand {
    /// Execute the command with the provided context, returning a structured output
    fn handle(&self, ctx: &CliContext) -> impl Future<Output = anyhow::Result<CommandOutput>>;
}

/// Used for displaying human-readable output vs JSON format
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    Text,
    Json,
}

impl std::str::FromStr for OutputKind {
    type Err = OutputParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "plain" | "text" => Ok(Self::Text),
            _ => Err(OutputParseErr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputParseErr;

impl std::error::Error for OutputParseErr {}

impl std::fmt::Display for OutputParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error parsing output type, see help for the list of accepted outputs"
        )
    }
}

/// The final output for a coco CLI command
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    /// The message to display to the user
    message: String,
    /// Whether or not the command was successful
    success: bool,
    /// Additional data that can be included in JSON output
    data: Option<serde_json::Value>,
    /// The kind of output requested (text or JSON)
    #[serde(skip_serializing)]
    output_kind: OutputKind,
}

impl CommandOutput {
    pub fn ok(message: impl ToString, data: Option<serde_json::Value>) -> Self {
        Self {
            message: message.to_string(),
            success: true,
            data,
            output_kind: OutputKind::Text, // Default to Text, can be overridden later
        }
    }

    pub fn error(message: impl ToString, data: Option<serde_json::Value>) -> Self {
        Self {
            message: message.to_string(),
            success: false,
            data,
            output_kind: OutputKind::Text, // Default to Text, can be overridden later
        }
    }

    pub fn with_output_kind(self, output_kind: OutputKind) -> Self {
        Self {
            output_kind,
            ..self
        }
    }

    /// Render the output as a string, returning the CLI message and whether it was successful
    pub fn render(self) -> (String, bool) {
        (
            match self.output_kind {
                OutputKind::Json => serde_json::to_string_pretty(&self).unwrap_or_else(|e| {
                    // Note that this matches the same structure as the CommandOutput
                    json!({
                        "message": "failed to serialize output",
                        "success": false,
                        "data": {
                            "error": e.to_string(),
                        }
                    })
                    .to_string()
                }),
                OutputKind::Text => self.message,
            },
            self.success,
        )
    }
}

/// CliContext holds the global context for the coco CLI
///
/// It resolves the configuration, data, and certificate directories
/// following the XDG Base Directory Specification (or the platform
/// equivalent) and hands out the merged configuration.
#[derive(Debug, Clone)]
pub struct CliContext {
    #[cfg(unix)]
    app_strategy: Xdg,
    #[cfg(windows)]
    app_strategy: Windows,
}

#[cfg(unix)]
impl Deref for CliContext {
    type Target = Xdg;

    fn deref(&self) -> &Xdg {
        &self.app_strategy
    }
}
#[cfg(windows)]
impl Deref for CliContext {
    type Target = Windows;

    fn deref(&self) -> &Windows {
        &self.app_strategy
    }
}

impl CliContext {
    /// Creates a new [CliContext], making sure the config and data
    /// directories exist.
    pub async fn new() -> anyhow::Result<Self> {
        let app_strategy = choose_app_strategy(AppStrategyArgs {
            top_level_domain: "io.confidential-containers".to_string(),
            author: "Confidential Containers".to_string(),
            app_name: "coco".to_string(),
        })
        .context("failed to determine file system strategy")?;

        if app_strategy.config_dir().exists() {
            trace!(
                dir = ?app_strategy.config_dir(),
                "config directory already exists, skipping creation"
            );
        } else {
            debug!(
                dir = ?app_strategy.config_dir(),
                "creating config directory for coco CLI"
            );
            tokio::fs::create_dir_all(app_strategy.config_dir())
                .await
                .context("failed to create config directory")?;
        }

        if app_strategy.data_dir().exists() {
            trace!(
                dir = ?app_strategy.data_dir(),
                "data directory already exists, skipping creation"
            );
        } else {
            debug!(
                dir = ?app_strategy.data_dir(),
                "creating data directory for coco CLI"
            );
            tokio::fs::create_dir_all(app_strategy.data_dir())
                .await
                .context("failed to create data directory")?;
        }

        Ok(Self { app_strategy })
    }

    pub fn config_path(&self) -> PathBuf {
        self.app_strategy.in_config_dir(CONFIG_FILE_NAME)
    }

    /// Where certificate material lives: the explicit directory when
    /// one was given, the data directory's `certs/` otherwise.
    pub fn cert_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.app_strategy.in_data_dir(CERT_DIR_NAME),
        }
    }

    /// Load the merged configuration, honoring an alternative config
    /// file when one was given on the command line.
    pub fn load_config(
        &self,
        path_override: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> crate::error::Result<Config> {
        let path = match path_override {
            Some(path) => path.to_path_buf(),
            None => self.config_path(),
        };
        load_config(&path, overrides)
    }
}
