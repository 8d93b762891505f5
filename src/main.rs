//! chvirt CLI entry point.

use chvirt::config::DriverConfig;
use chvirt::driver::ChDriver;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// chvirt - Cloud-Hypervisor domain runtime
#[derive(Parser, Debug)]
#[command(name = "chvirt")]
#[command(about = "Cloud-Hypervisor domain runtime")]
#[command(version)]
struct Cli {
    /// Driver configuration file (TOML).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the per-user session instance instead of the system one.
    #[arg(long)]
    session: bool,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Domain(cli::DomainCommand),

    /// Run the driver in the foreground.
    Daemon(cli::daemon::DaemonCmd),

    /// Inspect or write the driver configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.log_json);

    tracing::debug!(version = chvirt::VERSION, "starting chvirt");

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, kind = e.kind().name(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> chvirt::Result<()> {
    let config = DriverConfig::load(cli.config.as_deref(), !cli.session)?;

    match cli.command {
        Commands::Config(cmd) => cmd.run(&config, cli.config.as_deref()),
        Commands::Daemon(cmd) => cmd.run(config),
        Commands::Domain(cmd) => {
            let driver = ChDriver::initialize(config, false)?;
            let result = cmd.run(&driver);
            ChDriver::cleanup();
            result
        }
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chvirt=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
