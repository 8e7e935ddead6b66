// doc2md-engine - Conversion engines and the dispatcher
//
// The orchestrator treats converters as external collaborators behind one
// capability: `Engine::convert(request) -> EngineOutput`. Implementations
// here are child processes (the headless Office renderer, the PDF analyzer,
// the OCR analyzer); a linked library or RPC engine plugs into the same
// trait without touching the scheduler.
//
// The dispatcher selects the engine for a task type, composes multi-stage
// conversions through the task's temp directory, walks directories for the
// batch types, and classifies engine failures.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

mod analyzer;
mod dispatcher;
mod exec;
mod office;

pub use analyzer::{OcrEngine, PdfAnalyzerEngine};
pub use dispatcher::{BatchSummary, ConversionDispatcher, ConversionResult};
pub use office::OfficeEngine;

/// One conversion request. The engine reads `input`, writes its artifacts
/// under `output_dir`, and may scribble in `temp_dir`.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub input: &'a Path,
    pub output_dir: &'a Path,
    pub temp_dir: &'a Path,
    pub params: Option<&'a Value>,
}

/// Artifacts produced by a conversion.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// The most representative artifact (the `.md`, or the single file).
    pub primary: PathBuf,
    pub markdown_files: Vec<PathBuf>,
    pub json_files: Vec<PathBuf>,
    pub image_files: Vec<PathBuf>,
}

/// Engine failure classification. The tag prefixes every user-visible
/// `error_message` so failures can be triaged without reading stack traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    PasswordProtected,
    AcceleratorOom,
    AcceleratorUnavailable,
    UnsupportedFormat,
    PermissionDenied,
    InputNotFound,
    MissingDependency,
    Timeout,
    Unknown,
}

impl EngineErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EngineErrorKind::PasswordProtected => "password-protected",
            EngineErrorKind::AcceleratorOom => "accelerator-oom",
            EngineErrorKind::AcceleratorUnavailable => "accelerator-unavailable",
            EngineErrorKind::UnsupportedFormat => "unsupported-format",
            EngineErrorKind::PermissionDenied => "permission-denied",
            EngineErrorKind::InputNotFound => "input-not-found",
            EngineErrorKind::MissingDependency => "missing-dependency",
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// An engine failure with its classification. Renders as `tag: detail`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Classify raw engine output (stderr/stdout or an exception message)
    /// into a failure kind.
    pub fn classified(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            kind: classify_engine_error(&detail),
            detail,
        }
    }
}

/// Fixed classification table for raw engine output.
pub fn classify_engine_error(output: &str) -> EngineErrorKind {
    if output.contains("Incorrect password") || output.contains("PdfiumError") {
        EngineErrorKind::PasswordProtected
    } else if output.contains("CUDA out of memory") || output.contains("OutOfMemoryError") {
        EngineErrorKind::AcceleratorOom
    } else if output.contains("CUDA")
        && (output.contains("not available") || output.contains("unavailable"))
    {
        EngineErrorKind::AcceleratorUnavailable
    } else if output.contains("Permission denied") || output.contains("PermissionError") {
        EngineErrorKind::PermissionDenied
    } else if output.contains("No such file") || output.contains("FileNotFoundError") {
        EngineErrorKind::InputNotFound
    } else if output.contains("No module named")
        || output.contains("ImportError")
        || output.contains("command not found")
    {
        EngineErrorKind::MissingDependency
    } else if output.contains("no export filter")
        || output.contains("unsupported format")
        || output.contains("Unsupported format")
    {
        EngineErrorKind::UnsupportedFormat
    } else {
        EngineErrorKind::Unknown
    }
}

/// A pluggable converter. Conversions are blocking, CPU/GPU-heavy work; the
/// scheduler runs them only on conversion workers, never on coordinators.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn convert(&self, request: EngineRequest<'_>) -> Result<EngineOutput, EngineError>;

    /// Release accelerator memory held between conversions. Child-process
    /// engines release everything on exit, so the default is a no-op; the
    /// dispatcher still calls this after every conversion.
    async fn clear_caches(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(
            classify_engine_error("PdfiumError: Incorrect password error"),
            EngineErrorKind::PasswordProtected
        );
        assert_eq!(
            classify_engine_error("RuntimeError: CUDA out of memory"),
            EngineErrorKind::AcceleratorOom
        );
        assert_eq!(
            classify_engine_error("CUDA is not available on this host"),
            EngineErrorKind::AcceleratorUnavailable
        );
        assert_eq!(
            classify_engine_error("PermissionError: [Errno 13] Permission denied"),
            EngineErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_engine_error("FileNotFoundError: No such file or directory"),
            EngineErrorKind::InputNotFound
        );
        assert_eq!(
            classify_engine_error("ModuleNotFoundError: No module named 'magic_pdf'"),
            EngineErrorKind::MissingDependency
        );
        assert_eq!(
            classify_engine_error("Error: no export filter for this document"),
            EngineErrorKind::UnsupportedFormat
        );
        assert_eq!(
            classify_engine_error("something exploded"),
            EngineErrorKind::Unknown
        );
    }

    #[test]
    fn test_error_message_starts_with_tag() {
        let err = EngineError::classified("PdfiumError: Incorrect password error");
        assert!(err.to_string().starts_with("password-protected: "));

        let err = EngineError::new(EngineErrorKind::Timeout, "engine exceeded 600s");
        assert_eq!(err.to_string(), "timeout: engine exceeded 600s");
    }
}
