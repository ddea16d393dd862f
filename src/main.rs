use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fault_coordinator::config::Config;
use fault_coordinator::serve;

#[derive(Parser)]
#[command(name = "fault-coordinator", version, about = "Circuit breakers, degradation tiers and healing for a service fleet")]
struct Cli {
    /// Config file (defaults to ~/.config/fault-coordinator/config.yaml)
    #[arg(short, long, env = "FAULT_COORDINATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config file and exit
    Check,
    /// Serve JSON-RPC on stdio
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(Config::default_path()));
    let config = match Config::load_from(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Check => match config.validate_command_tables() {
            Ok(()) => {
                println!(
                    "{}: ok ({} services, {} tiers, {} strategies)",
                    path.display(),
                    config.services.len(),
                    config.tiers.len(),
                    config.strategies.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "invalid configuration");
                ExitCode::from(2)
            }
        },
        Command::Serve => match serve::run_server(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "server failed to start");
                ExitCode::FAILURE
            }
        },
    }
}
