// doc2md-config - Runtime configuration for the orchestrator
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from DOC2MD_CONFIG env var
// 3. Config file contents from DOC2MD_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.doc2md.toml)
// 5. Built-in defaults (lowest priority)
//
// S3 credentials additionally honor a fixed fallback chain of well-known
// external variable names (S3_*, AWS_*, MINIO_*), evaluated left-to-right;
// see sources.rs.

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

mod sources;
mod validation;

/// Main runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub engines: EngineConfig,
    pub server: ServerConfig,
    pub callback: CallbackConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            workspace: WorkspaceConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            engines: EngineConfig::default(),
            server: ServerConfig::default(),
            callback: CallbackConfig::default(),
        }
    }
}

/// Scheduler and worker-pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the conversion worker pool and the cap on concurrent
    /// `processing` rows.
    pub max_concurrent_tasks: usize,
    /// Fetcher poll interval in seconds.
    pub task_check_interval_secs: u64,
    /// GC worker interval in seconds.
    pub gc_interval_secs: u64,
    /// Age in days after which terminal rows are pruned. 0 disables pruning.
    pub retention_days: u32,
    /// Capacity of every bounded queue in the fabric.
    pub queue_capacity: usize,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.task_check_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            task_check_interval_secs: 5,
            gc_interval_secs: 1800,
            retention_days: 0,
            queue_capacity: 256,
        }
    }
}

/// Per-task workspace directories
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_dir: String,
    pub temp_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: "/app/task_workspace".to_string(),
            temp_dir: "/app/temp_files".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    Mysql,
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseKind::Sqlite => write!(f, "sqlite"),
            DatabaseKind::Mysql => write!(f, "mysql"),
        }
    }
}

impl std::str::FromStr for DatabaseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseKind::Sqlite),
            "mysql" => Ok(DatabaseKind::Mysql),
            _ => anyhow::bail!("Unsupported database kind: {}. Supported: sqlite, mysql", s),
        }
    }
}

/// Task store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Sqlite,
            url: "sqlite://document_tasks.db".to_string(),
        }
    }
}

/// Object-store settings, split by direction because source documents and
/// converted artifacts may live on different endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub download: S3Settings,
    pub upload: S3Settings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Default bucket for this direction. Uploads land in `ai-file` unless
    /// overridden.
    pub bucket: String,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            bucket: "ai-file".to_string(),
        }
    }
}

/// External conversion engine commands
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Headless Office renderer binary.
    pub office_command: String,
    /// PDF-to-Markdown analyzer command.
    pub pdf_command: String,
    /// OCR analyzer command for image inputs.
    pub ocr_command: String,
    /// Per-invocation timeout in seconds.
    pub timeout_secs: u64,
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            office_command: "soffice".to_string(),
            pdf_command: "mineru".to_string(),
            ocr_command: "mineru".to_string(),
            timeout_secs: 600,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// When set, logs additionally go to `<log_dir>/doc2md.log`.
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Completion callback delivery
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl CallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_attempts: 3,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load from an explicit file path, still honoring env overrides
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        sources::load_config_from_path(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_database_kind_from_str() {
        assert_eq!(
            DatabaseKind::from_str("sqlite").unwrap(),
            DatabaseKind::Sqlite
        );
        assert_eq!(
            DatabaseKind::from_str("MySQL").unwrap(),
            DatabaseKind::Mysql
        );
        assert!(DatabaseKind::from_str("postgres").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 3);
        assert_eq!(config.scheduler.task_check_interval_secs, 5);
        assert_eq!(config.workspace.base_dir, "/app/task_workspace");
        assert_eq!(config.storage.upload.bucket, "ai-file");
        assert_eq!(config.server.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.callback.max_attempts, 3);
        assert_eq!(config.engines.office_command, "soffice");
    }

    #[test]
    fn test_toml_parsing() {
        let raw = r#"
            [scheduler]
            max_concurrent_tasks = 8
            task_check_interval_secs = 1

            [database]
            kind = "mysql"
            url = "mysql://doc2md:secret@db/doc2md"

            [storage.upload]
            bucket = "artifacts"
            region = "eu-west-1"

            [server]
            log_format = "json"
        "#;
        let config: RuntimeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 8);
        assert_eq!(config.database.kind, DatabaseKind::Mysql);
        assert_eq!(config.storage.upload.bucket, "artifacts");
        assert_eq!(config.storage.download.bucket, "ai-file");
        assert_eq!(config.server.log_format, LogFormat::Json);
    }
}
