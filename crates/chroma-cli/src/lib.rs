//! Chroma CLI library
//!
//! Operator commands over an application's declared configuration and its
//! durable storage: required host permissions, persisted store snapshots,
//! cron schedule previews and configuration checks.

pub mod cli;
pub mod commands;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use error::{CliError, Result};
