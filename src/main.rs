// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use parley_node::StartupError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("parley: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = parley_config::load(cli.config.as_deref())
        .map_err(|e| StartupError::Misconfiguration(e.to_string()))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => parley_node::serve(config).await,
        Commands::ShowConfig => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| StartupError::Misconfiguration(e.to_string()))?;
            println!("{yaml}");
            Ok(())
        }
        Commands::InitStore => {
            parley_store::Store::open(&config.store.path, config.embedding.dimension)
                .map_err(|e| StartupError::StoreUnreachable(e.to_string()))?;
            println!("store initialised at {}", config.store.path);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}
