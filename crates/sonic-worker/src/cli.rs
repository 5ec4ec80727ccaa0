//! CLI command definitions using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Sonic worker - talking-head video generation on a single accelerator
#[derive(Parser)]
#[command(name = "sonic-worker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long, global = true, env = "SONIC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the model bundle and exit
    Warmup,

    /// Run jobs through the worker and print one JSON result per job
    ///
    /// Without --input or --test-input, one JSON request is read per line
    /// from stdin.
    Run {
        /// Job request files; each holds one request or an array of them
        #[arg(short, long, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Inline job request
        #[arg(long, conflicts_with = "input")]
        test_input: Option<String>,
    },

    /// Print the effective configuration
    Config,
}
