// doc2md-store - Durable task store
//
// One logical table, `document_tasks`, holds every task and its lifecycle
// fields. The store is the single source of truth for the scheduler: all
// cross-worker communication happens by passing ids and re-reading rows, so
// every operation here is single-row atomic and durably committed before it
// returns.
//
// Two backends implement the same trait:
// - SQLite (single-instance deployments, also used by the test suites)
// - MySQL (shared-store deployments)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use doc2md_core::{
    DocumentTask, TaskCreate, TaskFilter, TaskStatistics, TaskStatus, TaskType,
};

pub mod mysql;
pub mod sqlite;

pub use mysql::MySqlTaskStore;
pub use sqlite::SqliteTaskStore;

/// Unified error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Partial update of a task row. `None` fields are left untouched;
/// `updated_at` is always refreshed. `error_message` is doubly optional so a
/// patch can explicitly clear it (retry does).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub output_url: Option<String>,
    pub s3_urls: Option<Vec<String>>,
    pub result: Option<Value>,
    pub error_message: Option<Option<String>>,
    pub engine_name: Option<String>,
    pub retry_count: Option<i32>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_processing_time: Option<f64>,
    pub callback_status_code: Option<i32>,
    pub callback_message: Option<String>,
    pub callback_time: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.task_type.is_none()
            && self.input_path.is_none()
            && self.output_path.is_none()
            && self.file_name.is_none()
            && self.file_size_bytes.is_none()
            && self.output_url.is_none()
            && self.s3_urls.is_none()
            && self.result.is_none()
            && self.error_message.is_none()
            && self.engine_name.is_none()
            && self.retry_count.is_none()
            && self.last_retry_at.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.task_processing_time.is_none()
            && self.callback_status_code.is_none()
            && self.callback_message.is_none()
            && self.callback_time.is_none()
    }
}

/// Transactional task store keyed by id, indexed by status and creation time.
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Insert a new `pending` row and return its assigned id. Ids are
    /// monotonically increasing and never reused.
    async fn create(&self, create: &TaskCreate) -> Result<i64, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<DocumentTask>, StoreError>;

    /// Partial update. Returns false when the row does not exist.
    async fn update(&self, id: i64, patch: TaskPatch) -> Result<bool, StoreError>;

    /// Status transition helper: stamps `started_at` on entry to
    /// `processing` and `completed_at` on entry to a terminal state.
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let patch = TaskPatch {
            status: Some(status),
            started_at: (status == TaskStatus::Processing).then_some(now),
            completed_at: matches!(status, TaskStatus::Completed | TaskStatus::Failed)
                .then_some(now),
            error_message: error_message.map(|e| Some(e.to_string())),
            ..Default::default()
        };
        self.update(id, patch).await
    }

    /// Compare-and-set `pending -> processing`. Returns false when the row
    /// has moved on (another fetcher tick claimed it, or it was retried).
    async fn claim_pending(&self, id: i64) -> Result<bool, StoreError>;

    /// Record the outcome of a completion callback attempt. Never changes
    /// the task status.
    async fn record_callback(
        &self,
        id: i64,
        status_code: Option<i32>,
        message: &str,
    ) -> Result<bool, StoreError> {
        let patch = TaskPatch {
            callback_status_code: status_code,
            callback_message: Some(message.to_string()),
            callback_time: Some(Utc::now()),
            ..Default::default()
        };
        self.update(id, patch).await
    }

    /// Filtered listing, ordered `created_at DESC`.
    async fn query(&self, filter: &TaskFilter) -> Result<Vec<DocumentTask>, StoreError>;

    /// Pending rows in claim order: `(priority DESC, created_at ASC)`.
    async fn fetch_claimable(&self, limit: u32) -> Result<Vec<DocumentTask>, StoreError>;

    async fn by_status(
        &self,
        status: TaskStatus,
        limit: u32,
    ) -> Result<Vec<DocumentTask>, StoreError> {
        self.query(&TaskFilter::with_status(status, limit)).await
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError>;

    async fn statistics(&self) -> Result<TaskStatistics, StoreError>;

    /// Delete terminal rows older than the given number of days. Returns the
    /// number of rows removed.
    async fn delete_older_than(
        &self,
        days: u32,
        statuses: &[TaskStatus],
    ) -> Result<u64, StoreError>;

    async fn close(&self);
}

/// Column list shared by both backends; kept in one place so SELECTs and the
/// row mappers cannot drift apart.
pub(crate) const TASK_COLUMNS: &str = "id, task_type, status, priority, bucket_name, file_path, \
     file_url, input_path, file_name, file_size_bytes, output_path, output_url, s3_urls, \
     params, result, error_message, created_at, updated_at, started_at, completed_at, \
     task_processing_time, retry_count, max_retry_count, last_retry_at, callback_url, \
     callback_status_code, callback_message, callback_time, platform, engine_name";

pub(crate) fn encode_json(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(Into::into)
}

pub(crate) fn decode_json(raw: Option<String>) -> Result<Option<Value>, StoreError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

pub(crate) fn decode_urls(raw: Option<String>) -> Result<Vec<String>, StoreError> {
    match raw {
        Some(s) => serde_json::from_str(&s).map_err(Into::into),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn parse_task_type(raw: &str) -> Result<TaskType, StoreError> {
    raw.parse().map_err(StoreError::Database)
}

pub(crate) fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse().map_err(StoreError::Database)
}

pub(crate) fn parse_priority(raw: &str) -> Result<doc2md_core::TaskPriority, StoreError> {
    raw.parse().map_err(StoreError::Database)
}
