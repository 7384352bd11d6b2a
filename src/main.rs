// aki_predict - main.rs
// Loads configuration, installs logging and hands off to the CLI dispatcher.

use aki_predict::cli::{dispatch, Cli};
use aki_predict::config::AppConfig;
use aki_predict::log_sink::init_tracing;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_filter);

    match dispatch(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
