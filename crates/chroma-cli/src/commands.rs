//! Command handlers for the Chroma CLI

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chroma_core::{required_permissions, ChromaConfig, FileStorage, KeyValueStorage};
use chroma_runtime::{parse_schedule, upcoming};
use tracing::{debug, info};

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command, writing its report to `out`
    pub async fn execute<W: Write>(cli: Cli, out: &mut W) -> Result<()> {
        match cli.command {
            Commands::Permissions => {
                let path = cli
                    .config
                    .ok_or_else(|| CliError::MissingArgument("--config".to_string()))?;
                let config = load_configuration(Some(&path))?;
                Self::handle_permissions_command(&config, out)
            }
            Commands::Inspect { storage, store } => {
                let config = load_configuration(cli.config.as_deref())?;
                Self::handle_inspect_command(&config, storage, store.as_deref(), out).await
            }
            Commands::Cron { expr, count } => {
                Self::handle_cron_command(&expr, count, Utc::now(), out)
            }
            Commands::CheckConfig { file } => Self::handle_check_config_command(&file, out),
        }
    }

    /// Handle the permissions command
    pub fn handle_permissions_command<W: Write>(config: &ChromaConfig, out: &mut W) -> Result<()> {
        let permissions = required_permissions(&config.app);
        debug!(
            "App '{}' declares {} stores and {} jobs",
            config.app.name,
            config.app.stores.len(),
            config.app.jobs.len()
        );
        if permissions.is_empty() {
            writeln!(out, "(none)")?;
        }
        for permission in permissions {
            writeln!(out, "{}", permission)?;
        }
        Ok(())
    }

    /// Handle the inspect command
    pub async fn handle_inspect_command<W: Write>(
        config: &ChromaConfig,
        storage: Option<PathBuf>,
        store: Option<&str>,
        out: &mut W,
    ) -> Result<()> {
        let path = storage.unwrap_or_else(|| config.storage.path.clone());
        info!("Inspecting storage document {}", path.display());
        let storage = FileStorage::new(path);
        let prefix = &config.store.key_prefix;

        let keys = match store {
            Some(name) => vec![config.store.storage_key(name)],
            None => storage
                .keys()
                .await?
                .into_iter()
                .filter(|key| key.starts_with(prefix.as_str()))
                .collect(),
        };

        let snapshots = storage.get(&keys).await?;
        if let Some(name) = store {
            if snapshots.is_empty() {
                return Err(CliError::NotFound(format!("store '{}'", name)));
            }
        }
        if snapshots.is_empty() {
            writeln!(out, "(no stores)")?;
        }
        for (key, snapshot) in snapshots {
            let name = key.strip_prefix(prefix.as_str()).unwrap_or(&key);
            writeln!(out, "{}: {}", name, serde_json::to_string_pretty(&snapshot)?)?;
        }
        Ok(())
    }

    /// Handle the cron command
    pub fn handle_cron_command<W: Write>(
        expr: &str,
        count: usize,
        now: DateTime<Utc>,
        out: &mut W,
    ) -> Result<()> {
        let schedule = parse_schedule(expr)?;
        for time in upcoming(&schedule, now, count) {
            writeln!(out, "{}", time.to_rfc3339())?;
        }
        Ok(())
    }

    /// Handle the check-config command
    pub fn handle_check_config_command<W: Write>(file: &Path, out: &mut W) -> Result<()> {
        let config = ChromaConfig::load_from_file(file)?;
        for job in &config.app.jobs {
            parse_schedule(&job.schedule)?;
        }
        writeln!(
            out,
            "{}: ok ({} stores, {} jobs)",
            file.display(),
            config.app.stores.len(),
            config.app.jobs.len()
        )?;
        Ok(())
    }
}

/// Load configuration from file or use defaults
fn load_configuration(path: Option<&Path>) -> Result<ChromaConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ChromaConfig::load_from_file(path)?)
        }
        None => {
            info!("Using default configuration");
            Ok(ChromaConfig::default())
        }
    }
}
