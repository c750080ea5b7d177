//! Command-line access terminal for smart card credentials

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use portier_terminal::AccessDecision;

mod commands;
mod config;
mod utils;

use commands::*;

#[derive(Parser)]
#[command(
    version,
    about = "Smart card access terminal",
    long_about = "Smart card access terminal\n\n\
        Cards must run the matching access applet: secp256k1 CV certificates and \
        the 80 86 / 80 11 secure channel under the configured AID. \
        A stock SmartCard-HSM is denied at the handshake."
)]
struct Cli {
    /// Configuration file (defaults to ~/.portier/portier.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug level output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Run the terminal loop until interrupted
    Run {
        /// Reader to watch (overrides the configuration)
        #[arg(short, long)]
        reader: Option<String>,

        /// Ask for the PIN on the console for every card
        #[arg(long)]
        pin_pad: bool,
    },

    /// Evaluate a single card and exit with its decision
    Check {
        /// Reader to watch (overrides the configuration)
        #[arg(short, long)]
        reader: Option<String>,

        /// PIN to verify (overrides the configuration)
        #[arg(long)]
        pin: Option<String>,
    },

    /// Evaluate a virtual card issued by a freshly generated PKI
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let decision = match cli.command {
        Commands::List => {
            list_command()?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Run { reader, pin_pad } => {
            let config = config::load_config(cli.config.as_deref())?;
            run_command(config, reader, pin_pad).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Check { reader, pin } => {
            let config = config::load_config(cli.config.as_deref())?;
            check_command(config, reader, pin).await?
        }
        Commands::Simulate(args) => {
            let config = config::load_config(cli.config.as_deref())?;
            simulate_command(&config, &args)?
        }
    };

    Ok(exit_code(decision))
}

const fn exit_code(decision: Option<AccessDecision>) -> ExitCode {
    match decision {
        Some(AccessDecision::Granted) => ExitCode::SUCCESS,
        Some(AccessDecision::Denied) | None => ExitCode::FAILURE,
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}
