//! Chroma CLI - main entry point

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use chroma_cli::{cli::Cli, commands::CommandDispatcher, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    let mut stdout = std::io::stdout();
    if let Err(e) = CommandDispatcher::execute(cli, &mut stdout).await {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let directives = log_directives(verbose, std::env::var("CHROMA_LOG").ok());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .without_time()
        .init();
}

/// Filter directives: `CHROMA_LOG` wins, otherwise the chroma crates at the verbosity level
fn log_directives(verbose: bool, env: Option<String>) -> String {
    if let Some(directives) = env.filter(|d| !d.trim().is_empty()) {
        return directives;
    }
    let log_level = if verbose { "debug" } else { "info" };
    format!(
        "chroma_cli={0},chroma_runtime={0},chroma_core={0}",
        log_level
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directives_follow_verbosity() {
        assert_eq!(
            log_directives(false, None),
            "chroma_cli=info,chroma_runtime=info,chroma_core=info"
        );
        assert!(log_directives(true, None).contains("chroma_runtime=debug"));
    }

    #[test]
    fn test_log_directives_env_override() {
        assert_eq!(
            log_directives(false, Some("chroma_core=trace".into())),
            "chroma_core=trace"
        );
        assert_eq!(
            log_directives(true, Some("  ".into())),
            log_directives(true, None)
        );
    }
}
