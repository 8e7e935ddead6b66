// Configuration source loading
//
// Loads configuration from multiple sources with priority:
// 1. Environment variables (highest)
// 2. Config file from DOC2MD_CONFIG path
// 3. Inline config from DOC2MD_CONFIG_CONTENT
// 4. Default config files (./config.toml, ./.doc2md.toml)
// 5. Built-in defaults (lowest)

use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const ENV_PREFIX: &str = "DOC2MD_";

/// Credential discovery chains for the two storage directions. Each chain is
/// fixed and evaluated left-to-right; the first non-empty variable wins.
/// These are raw variable names (no DOC2MD_ prefix) so existing S3/MinIO
/// deployments work without renaming anything.
const DOWNLOAD_ACCESS_KEY_CHAIN: &[&str] = &[
    "S3_ACCESS_KEY_ID",
    "S3_ACCESS_KEY",
    "AWS_ACCESS_KEY_ID",
    "MINIO_ACCESS_KEY",
    "MINIO_ROOT_USER",
];
const DOWNLOAD_SECRET_KEY_CHAIN: &[&str] = &[
    "S3_SECRET_ACCESS_KEY",
    "S3_SECRET_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "MINIO_SECRET_KEY",
    "MINIO_ROOT_PASSWORD",
];
const DOWNLOAD_ENDPOINT_CHAIN: &[&str] = &["S3_ENDPOINT_URL", "S3_ENDPOINT", "MINIO_ENDPOINT"];
const DOWNLOAD_REGION_CHAIN: &[&str] = &["S3_REGION", "AWS_REGION"];
const DOWNLOAD_BUCKET_CHAIN: &[&str] = &["S3_BUCKET", "UPLOAD_S3_BUCKET"];

const UPLOAD_ACCESS_KEY_CHAIN: &[&str] = &[
    "UPLOAD_S3_ACCESS_KEY_ID",
    "S3_ACCESS_KEY_ID",
    "AWS_ACCESS_KEY_ID",
];
const UPLOAD_SECRET_KEY_CHAIN: &[&str] = &[
    "UPLOAD_S3_SECRET_ACCESS_KEY",
    "S3_SECRET_ACCESS_KEY",
    "AWS_SECRET_ACCESS_KEY",
];
const UPLOAD_ENDPOINT_CHAIN: &[&str] = &["UPLOAD_S3_ENDPOINT_URL", "S3_ENDPOINT_URL"];
const UPLOAD_REGION_CHAIN: &[&str] = &["UPLOAD_S3_REGION", "S3_REGION", "AWS_REGION"];
const UPLOAD_BUCKET_CHAIN: &[&str] = &["UPLOAD_S3_BUCKET"];

/// Load configuration from all sources
pub fn load_config() -> Result<RuntimeConfig> {
    // Start with built-in defaults
    let mut config = RuntimeConfig::default();

    // Try to load from config file (if available)
    if let Some(file_config) = load_from_file()? {
        config = file_config;
    }

    // Override with environment variables (highest priority)
    apply_env_overrides(&mut config)?;

    // Validate final configuration
    config.validate()?;

    Ok(config)
}

/// Load configuration from an explicit path, then apply env overrides
pub fn load_config_from_path(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;

    Ok(config)
}

/// Load configuration from file
fn load_from_file() -> Result<Option<RuntimeConfig>> {
    // Check for explicit config file path
    if let Ok(path) = env::var("DOC2MD_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        return Ok(Some(config));
    }

    // Check for inline config content
    if let Ok(content) = env::var("DOC2MD_CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from DOC2MD_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    // Try default config file locations
    for path in &["./config.toml", "./.doc2md.toml"] {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config: RuntimeConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok(Some(config));
        }
    }

    Ok(None)
}

/// Apply environment variable overrides (highest priority)
fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    // Scheduler configuration
    if let Some(val) = get_env_usize("MAX_CONCURRENT_TASKS")? {
        config.scheduler.max_concurrent_tasks = val;
    }
    if let Some(val) = get_env_u64("TASK_CHECK_INTERVAL_SECS")? {
        config.scheduler.task_check_interval_secs = val;
    }
    if let Some(val) = get_env_u64("GC_INTERVAL_SECS")? {
        config.scheduler.gc_interval_secs = val;
    }
    if let Some(val) = get_env_u32("RETENTION_DAYS")? {
        config.scheduler.retention_days = val;
    }

    // Workspace configuration
    if let Some(dir) = get_env_string("WORKSPACE_BASE_DIR")? {
        config.workspace.base_dir = dir;
    }
    if let Some(dir) = get_env_string("TEMP_DIR")? {
        config.workspace.temp_dir = dir;
    }

    // Database configuration
    if let Some(kind) = get_env_string("DATABASE_KIND")? {
        config.database.kind = kind
            .parse()
            .context("Invalid DOC2MD_DATABASE_KIND value")?;
    }
    if let Some(url) = get_env_string("DATABASE_URL")? {
        config.database.url = url;
    }

    // Storage credential chains
    apply_storage_chains(config);

    // Engine configuration
    if let Some(cmd) = get_env_string("OFFICE_COMMAND")? {
        config.engines.office_command = cmd;
    }
    if let Some(cmd) = get_env_string("PDF_COMMAND")? {
        config.engines.pdf_command = cmd;
    }
    if let Some(cmd) = get_env_string("OCR_COMMAND")? {
        config.engines.ocr_command = cmd;
    }
    if let Some(val) = get_env_u64("ENGINE_TIMEOUT_SECS")? {
        config.engines.timeout_secs = val;
    }

    // Server configuration
    if let Some(addr) = get_env_string("LISTEN_ADDR")? {
        config.server.listen_addr = addr;
    }
    if let Some(level) = get_env_string("LOG_LEVEL")? {
        config.server.log_level = level;
    }
    if let Some(format) = get_env_string("LOG_FORMAT")? {
        config.server.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }
    if let Some(dir) = get_env_string("LOG_DIR")? {
        config.server.log_dir = Some(dir);
    }

    // Callback configuration
    if let Some(val) = get_env_u64("CALLBACK_TIMEOUT_SECS")? {
        config.callback.timeout_secs = val;
    }
    if let Some(val) = get_env_u32("CALLBACK_MAX_ATTEMPTS")? {
        config.callback.max_attempts = val;
    }

    Ok(())
}

/// Fill storage settings from the external credential chains. Values already
/// set by the config file are only replaced when a chain variable is present.
fn apply_storage_chains(config: &mut RuntimeConfig) {
    let download = &mut config.storage.download;
    if let Some(val) = env_chain(DOWNLOAD_ACCESS_KEY_CHAIN) {
        download.access_key_id = Some(val);
    }
    if let Some(val) = env_chain(DOWNLOAD_SECRET_KEY_CHAIN) {
        download.secret_access_key = Some(val);
    }
    if let Some(val) = env_chain(DOWNLOAD_ENDPOINT_CHAIN) {
        download.endpoint = Some(val);
    }
    if let Some(val) = env_chain(DOWNLOAD_REGION_CHAIN) {
        download.region = val;
    }
    if let Some(val) = env_chain(DOWNLOAD_BUCKET_CHAIN) {
        download.bucket = val;
    }

    let upload = &mut config.storage.upload;
    if let Some(val) = env_chain(UPLOAD_ACCESS_KEY_CHAIN) {
        upload.access_key_id = Some(val);
    }
    if let Some(val) = env_chain(UPLOAD_SECRET_KEY_CHAIN) {
        upload.secret_access_key = Some(val);
    }
    if let Some(val) = env_chain(UPLOAD_ENDPOINT_CHAIN) {
        upload.endpoint = Some(val);
    }
    if let Some(val) = env_chain(UPLOAD_REGION_CHAIN) {
        upload.region = val;
    }
    if let Some(val) = env_chain(UPLOAD_BUCKET_CHAIN) {
        upload.bucket = val;
    }
}

/// First non-empty variable in the chain wins.
fn env_chain(chain: &[&str]) -> Option<String> {
    for name in chain {
        if let Ok(val) = env::var(name) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Helper: Get environment variable as string
fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read env var {}", full_key)),
    }
}

/// Helper: Get environment variable as usize
fn get_env_usize(key: &str) -> Result<Option<usize>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<usize>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as u64
fn get_env_u64(key: &str) -> Result<Option<u64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as u32
fn get_env_u32(key: &str) -> Result<Option<u32>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u32>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_chain_order() {
        // Chains consult variables strictly left-to-right
        assert_eq!(env_chain(&["DOC2MD_TEST_UNSET_A", "DOC2MD_TEST_UNSET_B"]), None);
    }

    #[test]
    fn test_chain_declarations() {
        // The documented chains must keep their direction-specific variable first
        assert_eq!(DOWNLOAD_ACCESS_KEY_CHAIN[0], "S3_ACCESS_KEY_ID");
        assert_eq!(UPLOAD_ACCESS_KEY_CHAIN[0], "UPLOAD_S3_ACCESS_KEY_ID");
        assert_eq!(UPLOAD_ENDPOINT_CHAIN.last(), Some(&"S3_ENDPOINT_URL"));
    }
}
