use std::io::IsTerminal;
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing::instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use coco::cli::certs::CertsCommand;
use coco::cli::config::ConfigCommand;
use coco::cli::convert::ConvertCommand;
use coco::cli::{CliCommand, CliContext, CommandOutput, OutputKind};

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "coco",
    version,
    about = "Convert Kubernetes workloads to run on confidential containers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Output format for command results
    #[clap(short = 'o', long = "output", default_value = "text", global = true)]
    output: OutputKind,

    /// Log level for the CLI
    #[clap(
        short = 'l',
        long = "log-level",
        default_value_t = tracing::Level::INFO,
        global = true
    )]
    log_level: tracing::Level,

    /// Include target, file, and line information in log output
    #[clap(long = "verbose", global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: CocoCliCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum CocoCliCommand {
    /// Convert a workload manifest for a confidential runtime class
    #[clap(name = "convert")]
    Convert(ConvertCommand),
    /// Manage the certificate authority used for sidecar TLS
    #[clap(name = "certs", subcommand)]
    Certs(CertsCommand),
    /// Manage the CLI configuration
    #[clap(name = "config", subcommand)]
    Config(ConfigCommand),
}

impl CliCommand for CocoCliCommand {
    #[instrument(level = "debug", skip_all, name = "coco")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            CocoCliCommand::Convert(cmd) => cmd.handle(ctx).await,
            CocoCliCommand::Certs(cmd) => cmd.handle(ctx).await,
            CocoCliCommand::Config(cmd) => cmd.handle(ctx).await,
        }
    }
}

fn init_tracing(log_level: tracing::Level, verbose: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose);
    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();
}

fn exit_with_output(output: CommandOutput) -> ! {
    let (rendered, success) = output.render();
    println!("{rendered}");
    if success {
        exit(0);
    } else {
        exit(1);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level, cli.verbose);

    let ctx = match CliContext::new().await {
        Ok(ctx) => ctx,
        Err(e) => exit_with_output(
            CommandOutput::error(format!("{e:?}"), None).with_output_kind(cli.output),
        ),
    };

    // Failures become an error output in the requested format instead of
    // a panic, so scripted callers always get something parseable.
    let output = cli
        .command
        .handle(&ctx)
        .await
        .unwrap_or_else(|e| CommandOutput::error(format!("{e:?}"), None));
    exit_with_output(output.with_output_kind(cli.output));
}
