//! Task aggregate and its tagged enums.
//!
//! The task is the single unit of work in the system: one conversion with a
//! durable lifecycle. All cross-worker communication happens by passing task
//! ids and re-reading the row from the store, so this model is deliberately a
//! plain data carrier with no behavior beyond validation and accessors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversion task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    OfficeToPdf,
    PdfToMarkdown,
    OfficeToMarkdown,
    ImageToMarkdown,
    BatchOfficeToPdf,
    BatchPdfToMarkdown,
    BatchOfficeToMarkdown,
    BatchImageToMarkdown,
}

impl TaskType {
    /// Returns the string representation used in API payloads and the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::OfficeToPdf => "office_to_pdf",
            TaskType::PdfToMarkdown => "pdf_to_markdown",
            TaskType::OfficeToMarkdown => "office_to_markdown",
            TaskType::ImageToMarkdown => "image_to_markdown",
            TaskType::BatchOfficeToPdf => "batch_office_to_pdf",
            TaskType::BatchPdfToMarkdown => "batch_pdf_to_markdown",
            TaskType::BatchOfficeToMarkdown => "batch_office_to_markdown",
            TaskType::BatchImageToMarkdown => "batch_image_to_markdown",
        }
    }

    /// True for the batch variants that walk a directory instead of
    /// converting a single file.
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            TaskType::BatchOfficeToPdf
                | TaskType::BatchPdfToMarkdown
                | TaskType::BatchOfficeToMarkdown
                | TaskType::BatchImageToMarkdown
        )
    }

    /// The per-file kind a batch variant dispatches to. Identity for the
    /// single-file kinds.
    pub fn per_file_kind(&self) -> TaskType {
        match self {
            TaskType::BatchOfficeToPdf => TaskType::OfficeToPdf,
            TaskType::BatchPdfToMarkdown => TaskType::PdfToMarkdown,
            TaskType::BatchOfficeToMarkdown => TaskType::OfficeToMarkdown,
            TaskType::BatchImageToMarkdown => TaskType::ImageToMarkdown,
            other => *other,
        }
    }

    /// The type directory used in derived object-store keys.
    pub fn type_dir(&self) -> &'static str {
        match self.per_file_kind() {
            TaskType::OfficeToPdf => "pdf",
            TaskType::PdfToMarkdown | TaskType::OfficeToMarkdown | TaskType::ImageToMarkdown => {
                "markdown"
            }
            _ => "converted",
        }
    }

    /// Extension of the primary output artifact.
    pub fn output_extension(&self) -> &'static str {
        match self.per_file_kind() {
            TaskType::OfficeToPdf => "pdf",
            _ => "md",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "office_to_pdf" => Ok(TaskType::OfficeToPdf),
            "pdf_to_markdown" => Ok(TaskType::PdfToMarkdown),
            "office_to_markdown" => Ok(TaskType::OfficeToMarkdown),
            "image_to_markdown" => Ok(TaskType::ImageToMarkdown),
            "batch_office_to_pdf" => Ok(TaskType::BatchOfficeToPdf),
            "batch_pdf_to_markdown" => Ok(TaskType::BatchPdfToMarkdown),
            "batch_office_to_markdown" => Ok(TaskType::BatchOfficeToMarkdown),
            "batch_image_to_markdown" => Ok(TaskType::BatchImageToMarkdown),
            _ => Err(format!("unknown task type: {}", s)),
        }
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never picked up by the scheduler again without an
    /// explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

/// Scheduling priority. Strict: a ready high item always preempts a ready
/// normal item at the merger; starvation of low is acceptable by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            _ => Err(format!("unknown task priority: {}", s)),
        }
    }
}

/// The source of a task's input bytes, derived from whichever spec fields are
/// populated. Exactly one variant applies to a valid task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec<'a> {
    /// Download from the object store.
    ObjectStore { bucket: &'a str, key: &'a str },
    /// Fetch over HTTP. Accepted and persisted, but not implemented by the
    /// fetch-input step.
    FileUrl(&'a str),
    /// Copy from a path on the local filesystem.
    LocalPath(&'a str),
}

/// The task aggregate, mirroring one row of `document_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTask {
    pub id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,

    // Input
    pub bucket_name: Option<String>,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub input_path: Option<String>,
    pub file_name: Option<String>,
    pub file_size_bytes: Option<i64>,

    // Output
    pub output_path: Option<String>,
    pub output_url: Option<String>,
    pub s3_urls: Vec<String>,

    // Parameters and result, opaque to the orchestrator
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,

    // Lifecycle timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_processing_time: Option<f64>,

    // Retry bookkeeping
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,

    // Callback
    pub callback_url: Option<String>,
    pub callback_status_code: Option<i32>,
    pub callback_message: Option<String>,
    pub callback_time: Option<DateTime<Utc>>,

    pub platform: Option<String>,
    pub engine_name: Option<String>,
}

impl DocumentTask {
    /// Which source spec this task carries. Checked in declaration order so
    /// that `input_path` being rewritten to the workspace copy during
    /// processing does not shadow an object-store source.
    pub fn source_spec(&self) -> Option<SourceSpec<'_>> {
        if let (Some(bucket), Some(key)) = (self.bucket_name.as_deref(), self.file_path.as_deref())
        {
            return Some(SourceSpec::ObjectStore { bucket, key });
        }
        if let Some(url) = self.file_url.as_deref() {
            return Some(SourceSpec::FileUrl(url));
        }
        if let Some(path) = self.input_path.as_deref() {
            return Some(SourceSpec::LocalPath(path));
        }
        None
    }

    /// Engine hint lookup, tolerant of both JSON booleans and strings.
    pub fn param_flag(&self, name: &str) -> bool {
        match self.params.as_ref().and_then(|p| p.get(name)) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            _ => false,
        }
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|p| p.get(name))
            .and_then(|v| v.as_str())
    }
}

/// Rejections produced while validating a create request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskValidationError {
    #[error("must provide exactly one input: (bucket_name + file_path), file_url, or input_path")]
    MissingSource,
    #[error("only one input method allowed")]
    AmbiguousSource,
    #[error("max_retry_count must be at least 1")]
    InvalidRetryLimit,
}

/// Fields supplied by the caller when creating a task. The store assigns the
/// id and stamps `created_at`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskCreate {
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub bucket_name: Option<String>,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub params: Option<Value>,
    pub callback_url: Option<String>,
    pub platform: Option<String>,
    pub max_retry_count: Option<i32>,
}

impl TaskCreate {
    /// Enforces source-spec exclusivity: exactly one of the three input
    /// methods must be populated.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let sources = [
            self.bucket_name.is_some() && self.file_path.is_some(),
            self.file_url.is_some(),
            self.input_path.is_some(),
        ];
        match sources.iter().filter(|s| **s).count() {
            0 => Err(TaskValidationError::MissingSource),
            1 => {
                if self.max_retry_count.is_some_and(|n| n < 1) {
                    return Err(TaskValidationError::InvalidRetryLimit);
                }
                Ok(())
            }
            _ => Err(TaskValidationError::AmbiguousSource),
        }
    }
}

/// Query filter for task listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub task_type: Option<TaskType>,
    pub platform: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub has_result: Option<bool>,
    pub has_error: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

impl TaskFilter {
    pub fn with_status(status: TaskStatus, limit: u32) -> Self {
        Self {
            status: Some(status),
            limit,
            ..Default::default()
        }
    }
}

/// Aggregate counters exposed by the statistics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatistics {
    pub total_tasks: u64,
    pub pending_tasks: u64,
    pub processing_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    /// Completed / total, as a percentage rounded to two decimals.
    pub success_rate: f64,
    /// Mean of `task_processing_time` over rows that have one, in seconds.
    pub avg_processing_time: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_roundtrip() {
        let types = [
            TaskType::OfficeToPdf,
            TaskType::PdfToMarkdown,
            TaskType::OfficeToMarkdown,
            TaskType::ImageToMarkdown,
            TaskType::BatchOfficeToPdf,
            TaskType::BatchPdfToMarkdown,
            TaskType::BatchOfficeToMarkdown,
            TaskType::BatchImageToMarkdown,
        ];
        for ty in types {
            let parsed = TaskType::from_str(ty.as_str()).unwrap();
            assert_eq!(parsed, ty, "roundtrip failed for {:?}", ty);
        }
        assert!(TaskType::from_str("pdf_to_word").is_err());
    }

    #[test]
    fn test_type_dirs() {
        assert_eq!(TaskType::OfficeToPdf.type_dir(), "pdf");
        assert_eq!(TaskType::PdfToMarkdown.type_dir(), "markdown");
        assert_eq!(TaskType::OfficeToMarkdown.type_dir(), "markdown");
        assert_eq!(TaskType::BatchPdfToMarkdown.type_dir(), "markdown");
        assert_eq!(TaskType::BatchOfficeToPdf.type_dir(), "pdf");
    }

    #[test]
    fn test_batch_mapping() {
        assert!(TaskType::BatchPdfToMarkdown.is_batch());
        assert!(!TaskType::PdfToMarkdown.is_batch());
        assert_eq!(
            TaskType::BatchImageToMarkdown.per_file_kind(),
            TaskType::ImageToMarkdown
        );
        assert_eq!(TaskType::OfficeToPdf.per_file_kind(), TaskType::OfficeToPdf);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_create_validation() {
        let mut create = TaskCreate {
            task_type: Some(TaskType::PdfToMarkdown),
            ..Default::default()
        };
        assert_eq!(create.validate(), Err(TaskValidationError::MissingSource));

        create.bucket_name = Some("docs".into());
        // bucket without key is not a complete source spec
        assert_eq!(create.validate(), Err(TaskValidationError::MissingSource));

        create.file_path = Some("rep.pdf".into());
        assert_eq!(create.validate(), Ok(()));

        create.input_path = Some("/tmp/rep.pdf".into());
        assert_eq!(create.validate(), Err(TaskValidationError::AmbiguousSource));
    }

    #[test]
    fn test_source_spec_precedence() {
        let mut task = sample_task();
        task.bucket_name = Some("docs".into());
        task.file_path = Some("a/rep.pdf".into());
        // input_path has been rewritten to the workspace copy mid-flight
        task.input_path = Some("/workspace/task_1/input/rep.pdf".into());

        match task.source_spec() {
            Some(SourceSpec::ObjectStore { bucket, key }) => {
                assert_eq!(bucket, "docs");
                assert_eq!(key, "a/rep.pdf");
            }
            other => panic!("unexpected source spec: {:?}", other),
        }
    }

    #[test]
    fn test_param_flag() {
        let mut task = sample_task();
        task.params = Some(serde_json::json!({
            "force_reprocess": true,
            "recursive": "1",
            "file_pattern": ".*\\.pdf$",
        }));
        assert!(task.param_flag("force_reprocess"));
        assert!(task.param_flag("recursive"));
        assert!(!task.param_flag("missing"));
        assert_eq!(task.param_str("file_pattern"), Some(".*\\.pdf$"));
    }

    fn sample_task() -> DocumentTask {
        DocumentTask {
            id: 1,
            task_type: TaskType::PdfToMarkdown,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            bucket_name: None,
            file_path: None,
            file_url: None,
            input_path: None,
            file_name: None,
            file_size_bytes: None,
            output_path: None,
            output_url: None,
            s3_urls: Vec::new(),
            params: None,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
            completed_at: None,
            task_processing_time: None,
            retry_count: 0,
            max_retry_count: 3,
            last_retry_at: None,
            callback_url: None,
            callback_status_code: None,
            callback_message: None,
            callback_time: None,
            platform: None,
            engine_name: None,
        }
    }
}
