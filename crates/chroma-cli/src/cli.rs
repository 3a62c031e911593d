//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List the host permissions the configured app requires
    Permissions,
    /// Print persisted store snapshots
    Inspect {
        /// Storage document (defaults to the configured file backend path)
        #[arg(short, long)]
        storage: Option<PathBuf>,
        /// Only print this store
        #[arg(long)]
        store: Option<String>,
    },
    /// Validate a cron expression and print its next fire times
    Cron {
        /// Five-, six- or seven-field cron expression
        expr: String,
        /// Number of fire times to print
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Validate a configuration file
    CheckConfig {
        /// Configuration file to check
        file: PathBuf,
    },
}
