//! Scriptorium CLI Application Entry Point
//!
//! A thin composition layer: parses CLI arguments, initializes logging, and
//! routes to the requested command, converting any fatal startup error to a
//! non-zero exit code.

use clap::Parser;

use scriptorium::app::{handle_fatal_error, logging, AppConfig};
use scriptorium::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let app_config = match AppConfig::discover(cli.repo.clone()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("scriptorium: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init_logging(cli.verbose, &app_config.project_name) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("scriptorium: failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = execute_command(cli).await {
        handle_fatal_error(e);
    }
}
