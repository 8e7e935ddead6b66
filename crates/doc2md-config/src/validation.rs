// Configuration validation
//
// Validates that required fields are present and values are sensible

use crate::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_scheduler_config(&config.scheduler)?;
    validate_workspace_config(&config.workspace)?;
    validate_database_config(&config.database)?;
    validate_server_config(&config.server)?;
    validate_callback_config(&config.callback)?;
    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<()> {
    if config.max_concurrent_tasks == 0 {
        bail!("scheduler.max_concurrent_tasks must be at least 1");
    }

    if config.task_check_interval_secs == 0 {
        bail!("scheduler.task_check_interval_secs must be greater than 0");
    }

    if config.queue_capacity == 0 {
        bail!("scheduler.queue_capacity must be greater than 0");
    }

    if config.max_concurrent_tasks > 64 {
        warn!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            "scheduler.max_concurrent_tasks is very large; conversions are CPU/GPU heavy"
        );
    }

    Ok(())
}

fn validate_workspace_config(config: &WorkspaceConfig) -> Result<()> {
    if config.base_dir.is_empty() {
        bail!("workspace.base_dir must not be empty");
    }

    if config.temp_dir.is_empty() {
        bail!("workspace.temp_dir must not be empty");
    }

    Ok(())
}

fn validate_database_config(config: &DatabaseConfig) -> Result<()> {
    if config.url.is_empty() {
        bail!("database.url must not be empty");
    }

    match config.kind {
        DatabaseKind::Sqlite => {
            if !config.url.starts_with("sqlite:") {
                bail!("database.url must start with sqlite: for the sqlite kind");
            }
        }
        DatabaseKind::Mysql => {
            if !config.url.starts_with("mysql:") {
                bail!("database.url must start with mysql: for the mysql kind");
            }
        }
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}

fn validate_callback_config(config: &CallbackConfig) -> Result<()> {
    if config.max_attempts == 0 {
        bail!("callback.max_attempts must be at least 1");
    }

    Ok(())
}
