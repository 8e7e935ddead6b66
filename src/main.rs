use anyhow::{Context, Result};
use clap::Parser;
use doc2md_config::RuntimeConfig;
use std::path::PathBuf;

/// Document-conversion task orchestrator
#[derive(Parser)]
#[command(name = "doc2md")]
#[command(version)]
#[command(about = "Document-conversion task orchestrator (Office/PDF/image to PDF/Markdown)", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Workspace base directory (overrides config file)
    #[arg(short, long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build tokio runtime and run the orchestrator
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load base configuration
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    // Apply CLI overrides (highest priority)
    apply_cli_overrides(&mut config, &cli);

    doc2md_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.listen_addr = format!("0.0.0.0:{}", port);
    }

    if let Some(workspace) = &cli.workspace {
        config.workspace.base_dir = workspace.to_string_lossy().to_string();
    }

    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
}
