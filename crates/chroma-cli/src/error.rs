//! Error handling for the Chroma CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Chroma error: {0}")]
    Chroma(#[from] chroma_core::ChromaError),

    #[error("Configuration error: {0}")]
    Config(#[from] chroma_core::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] chroma_core::PersistenceError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] chroma_core::SchedulerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
