//! Strata - tiered build cache and warm sandbox pools
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{commands, Cli, Commands};
use strata::config::ConfigManager;
use strata::error::StrataResult;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e.public_message());
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Install the tracing subscriber: 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> StrataResult<()> {
    let cli = Cli::parse();
    strata::ui::init_theme();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Config commands must work even when the file on disk does not validate
    let command = match cli.command {
        Commands::Config(args) => {
            init_logging(cli.verbose, false);
            return commands::config(args, &manager).await;
        }
        command => command,
    };

    let config = match manager.load().await {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, false);
            return Err(e);
        }
    };
    init_logging(cli.verbose, config.general.log_format == "json");

    ConfigManager::ensure_state_dirs().await?;

    match command {
        Commands::Key(args) => commands::key(args, &config).await,
        Commands::Classify(args) => commands::classify(args, &config).await,
        Commands::Cache(args) => commands::cache(args, &config).await,
        Commands::Pool(args) => commands::pool(args, &config).await,
        Commands::Config(args) => commands::config(args, &manager).await,
    }
}

