// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "relay",
    version,
    about = "Intercepting proxy between OpenAI-compatible clients and model providers"
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address from config
    #[arg(long)]
    pub listen: Option<String>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit
    ShowConfig,
}
