use clap::Parser;
use colored::*;
use std::process;

mod cli;
mod commands;
mod display;
mod error;

use cli::{Cli, Commands};
use commands::{load_config, CommandHandler};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            process::exit(1);
        }
    };

    let handler = CommandHandler::new(config, cli.format);
    if let Err(e) = execute_command(&handler, cli.command).await {
        eprintln!("{} {}", "Error:".red(), e);
        process::exit(1);
    }
}

async fn execute_command(handler: &CommandHandler, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Statestore { port } => handler.run_statestore(port).await,
        Commands::Backend {
            authority,
            service,
            address,
        } => handler.run_backend(authority.as_deref(), service, &address).await,
        Commands::Hosts {
            authority,
            service,
            expect,
            timeout_ms,
        } => {
            handler
                .show_hosts(authority.as_deref(), service, expect, timeout_ms)
                .await
        }
        Commands::Schedule {
            authority,
            service,
            expect,
            timeout_ms,
            items,
        } => {
            handler
                .schedule(authority.as_deref(), service, expect, timeout_ms, &items)
                .await
        }
        Commands::Probe {
            address,
            attempts,
            interval_ms,
        } => handler.probe(&address, attempts, interval_ms).await,
    }
}

fn setup_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
