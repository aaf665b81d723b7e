//! Command-line front end for the conductivity pipeline.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use kappa_core::calculator::LennardJonesPotential;
use kappa_core::config::Config;
use kappa_core::{pipeline, KappaError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Compute(KappaError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    pub fn as_kappa_error(&self) -> KappaError {
        match self {
            Self::Usage(message) => KappaError::input_validation("CLI.USAGE", message.clone()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => KappaError::internal("CLI.INTERNAL", format!("{error:#}")),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.as_kappa_error().exit_code()
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "kappa-rs",
    version,
    about = "Batch lattice thermal conductivity from extended-XYZ structure sets"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the full pipeline described by a TOML configuration file.
    Run {
        /// Path to the configuration file.
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file without running anything.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
}

/// Entry point for the binary: parses `std::env::args`, runs the requested
/// command, and maps any failure to its process exit code.
pub fn run_from_env() -> i32 {
    init_tracing();
    match run(std::env::args().skip(1)) {
        Ok(code) => code,
        Err(error) => {
            let diagnostic = error.as_kappa_error();
            eprintln!("{}", diagnostic.diagnostic_line());
            diagnostic.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut full_args = vec!["kappa-rs".to_string()];
    full_args.extend(args.into_iter().map(Into::into));

    let cli = match Cli::try_parse_from(&full_args) {
        Ok(cli) => cli,
        Err(error) => {
            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{error}");
                    Ok(0)
                }
                _ => Err(CliError::Usage(error.to_string())),
            };
        }
    };
    dispatch(cli.command)
}

fn dispatch(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Run { config } => {
            let config = Config::load(&config).map_err(CliError::Compute)?;
            let potential = LennardJonesPotential::default();
            pipeline::run(&config, &potential).map_err(CliError::Compute)?;
            Ok(0)
        }
        CliCommand::CheckConfig { config } => {
            Config::load(&config).map_err(CliError::Compute)?;
            println!("configuration ok: {}", config.display());
            Ok(0)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_is_not_an_error() {
        assert_eq!(run(["--help"]).unwrap(), 0);
        assert_eq!(run(["run", "--help"]).unwrap(), 0);
    }

    #[test]
    fn version_is_not_an_error() {
        assert_eq!(run(["--version"]).unwrap(), 0);
    }

    #[test]
    fn unknown_subcommand_is_a_usage_error() {
        let error = run(["frobnicate"]).unwrap_err();
        assert!(matches!(error, CliError::Usage(_)));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn missing_config_argument_is_a_usage_error() {
        let error = run(["run"]).unwrap_err();
        assert!(matches!(error, CliError::Usage(_)));
    }

    #[test]
    fn missing_config_file_maps_to_io_exit_code() {
        let error = run(["check-config", "--config", "/no/such/file.toml"]).unwrap_err();
        assert!(matches!(error, CliError::Compute(_)));
        assert_eq!(error.exit_code(), 3);
    }
}
