mod admin;
mod ops;
mod piped;

use clap::{crate_version, Parser, Subcommand};
use piped_runner::telemetry::{self, LogFormat};

use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "piped", about = "GitOps continuous-delivery agent", version = crate_version!())]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent.
    Piped(PipedArgs),
    /// Run the control-plane housekeeping surface.
    Ops(OpsArgs),
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// Path of the configuration file.
    #[arg(long, env = "PIPED_CONFIG_FILE")]
    config_file: PathBuf,

    /// Port the admin HTTP server listens on.
    #[arg(long, default_value_t = 9085, env = "PIPED_ADMIN_PORT")]
    admin_port: u16,

    /// Connect to the control plane without TLS verification.
    #[arg(long, default_value_t = false)]
    insecure: bool,

    /// Additional PEM root certificate for the control-plane connection.
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// Set logging filter directive, e.g. "info,piped_runner=debug".
    #[arg(long, default_value = "info", env = "PIPED_LOG_FILTER")]
    log_filter: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "PIPED_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(clap::Args, Debug)]
struct PipedArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// How long components get to unwind on shutdown or failure.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    grace_period: Duration,

    /// Directory holding the external tools (kubectl, helm, terraform, ...).
    #[arg(long)]
    tools_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct OpsArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    grace_period: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let common = match &cli.command {
        Command::Piped(args) => &args.common,
        Command::Ops(args) => &args.common,
    };
    telemetry::init(&common.log_filter, common.log_format).map_err(anyhow::Error::msg)?;

    match cli.command {
        Command::Piped(args) => piped::run(args).await,
        Command::Ops(args) => ops::run(args).await,
    }
}
