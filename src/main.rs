use clap::{Parser, Subcommand};
use pkgcheck::checks::{self, Command as CheckCommand, EXIT_PASS, EXIT_USAGE};
use pkgcheck::config::RunnerConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter, e.g. `pkgcheck=debug`.
const LOG_ENV: &str = "PKGCHECK_LOG";

#[derive(Parser)]
#[command(name = "pkgcheck")]
#[command(about = "Check dispatcher and tooling for package tests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a runner configuration file and print the effective settings
    Config {
        /// Path to a .yaml, .yml or .toml file
        path: PathBuf,
    },
    /// List the commands understood by the dispatcher
    Commands,
    /// A dispatcher command, e.g. `check-file-exists --no-follow-symlinks=false /etc/passwd`
    #[command(external_subcommand)]
    Check(Vec<String>),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // stdout belongs to the step being run; logs go to stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EXIT_USAGE } else { EXIT_PASS });
        }
    };

    match cli.command {
        Command::Config { path } => match RunnerConfig::load(&path) {
            Ok(config) => match serde_json::to_string_pretty(&config) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error encoding config: {e}");
                    ExitCode::from(EXIT_USAGE)
                }
            },
            Err(e) => {
                eprintln!("Error loading {}: {e}", path.display());
                ExitCode::from(EXIT_USAGE)
            }
        },
        Command::Commands => {
            for command in CheckCommand::ALL {
                println!("{command}");
            }
            ExitCode::SUCCESS
        }
        Command::Check(args) => ExitCode::from(checks::dispatch(&args)),
    }
}
