// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Multi-agent conversational server",
    version,
    arg_required_else_help = false
)]
pub struct Cli {
    /// Explicit config file path (merged over the discovered layers).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server (the default when no subcommand is given).
    Serve,
    /// Print the effective merged configuration as YAML.
    ShowConfig,
    /// Create the store schema and exit.
    InitStore,
}
