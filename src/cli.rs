// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// warren — a runtime for stateful, addressable AI agents.
#[derive(Parser, Debug)]
#[command(name = "warren", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Write tracing output to stderr (respects WARREN_LOG / RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node: HTTP + WebSocket edge over the instance host.
    ///
    /// Agent instances are addressed as `/{class}/{name}`; durable state
    /// lives in one SQLite file per instance under the data directory.
    Serve {
        /// Listen address override, e.g. `0.0.0.0:8787`.
        #[arg(long, env = "WARREN_BIND")]
        bind: Option<String>,

        /// Data directory override.
        #[arg(long, env = "WARREN_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}
