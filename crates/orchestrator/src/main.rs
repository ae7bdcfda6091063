use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use td_domain::config::Config;

/// Exit codes: 0 clean shutdown, 2 invalid configuration. Unrecoverable
/// startup errors propagate through the `anyhow` return and exit 1.
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "tandem", version, about = "Staged multi-agent workflow orchestrator")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/tandem.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the orchestrator (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigValidate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config);
            td_orchestrator::bootstrap::serve(Arc::new(config))
                .await
                .context("tandem startup failed")?;
        }
        Some(Command::ConfigValidate) => {
            let config = load_config(&cli.config);
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{:?}: {issue}", issue.severity);
            }
            if Config::has_errors(&issues) {
                std::process::exit(EXIT_CONFIG);
            }
            println!("configuration ok");
        }
    }
    Ok(())
}

/// Load the configuration, falling back to defaults when the file does
/// not exist. Parse errors and validation errors are fatal (exit 2).
fn load_config(path: &PathBuf) -> Config {
    let config = if path.exists() {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                eprintln!("cannot read {}: {e}", path.display());
                std::process::exit(EXIT_CONFIG);
            }
        };
        match toml::from_str::<Config>(&raw) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("invalid configuration {}: {e}", path.display());
                std::process::exit(EXIT_CONFIG);
            }
        }
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            td_domain::config::ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            td_domain::config::ConfigSeverity::Error => eprintln!("config error: {issue}"),
        }
    }
    if Config::has_errors(&issues) {
        std::process::exit(EXIT_CONFIG);
    }
    config
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,td_orchestrator=debug")),
        )
        .init();
}
