//! CLI interface for Slape
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Small Language-model Pipeline Engine
///
/// Runs small models in llama.cpp worker containers and chains them into
/// simple, chain-of-models and debate pipelines behind an HTTP API.
#[derive(Parser, Debug)]
#[command(name = "slape")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the HTTP service
    Serve,

    /// Stop and remove worker containers left behind by a previous run
    Reconcile {
        /// Only list orphaned workers, do not remove them
        #[arg(long)]
        dry_run: bool,
    },

    /// List model files in the models directory
    Models,

    /// Print the effective configuration
    Config,
}
