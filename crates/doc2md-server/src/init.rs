// Initialization utilities for the server
//
// Logging/tracing setup from RuntimeConfig

use std::sync::Arc;

use doc2md_config::{LogFormat, RuntimeConfig};

/// Initialize tracing/logging from RuntimeConfig. With `log_dir` set, output
/// also lands in `<log_dir>/doc2md.log`.
pub(crate) fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = config.server.log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create log dir {}: {}", dir, e);
            return None;
        }
        let path = std::path::Path::new(dir).join("doc2md.log");
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file))),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    match config.server.log_format {
        LogFormat::Json => {
            registry.with(fmt::layer().json()).init();
        }
        LogFormat::Text => {
            registry.with(fmt::layer()).init();
        }
    }
}
