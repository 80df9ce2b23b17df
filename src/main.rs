// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { bind, data_dir } => {
            let mut config = warren_config::load(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.http.bind = bind;
            }
            if let Some(dir) = data_dir {
                config.runtime.data_dir = Some(dir);
            }
            warren_node::run(config).await
        }
        Commands::ShowConfig => {
            let config = warren_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

/// Tracing setup: WARREN_LOG takes precedence over RUST_LOG; `--verbose`
/// defaults the filter to debug for the warren crates.
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "warn,warren=debug,warren_core=debug,warren_node=debug,warren_scheduler=debug"
    } else {
        "warn,warren=info,warren_core=info,warren_node=info"
    };
    let filter = std::env::var("WARREN_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
