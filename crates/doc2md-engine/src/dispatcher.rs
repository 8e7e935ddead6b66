//! Conversion dispatcher: engine selection, multi-stage composition, and
//! directory batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use doc2md_config::EngineConfig;
use doc2md_core::TaskType;

use crate::analyzer::{scan_output_tree, OcrEngine, PdfAnalyzerEngine};
use crate::office::OfficeEngine;
use crate::{Engine, EngineError, EngineErrorKind, EngineOutput, EngineRequest};

/// Aggregated counts for a batch conversion.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub converted: usize,
    pub failed: usize,
    /// (relative file name, classified error) per failed file.
    pub failures: Vec<(String, String)>,
}

/// Outcome of one dispatcher call.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub engine_name: String,
    pub output: EngineOutput,
    /// True when prior artifacts were reused instead of re-converting.
    pub skipped: bool,
    pub batch: Option<BatchSummary>,
}

pub struct ConversionDispatcher {
    office: Arc<dyn Engine>,
    pdf: Arc<dyn Engine>,
    ocr: Arc<dyn Engine>,
}

impl ConversionDispatcher {
    pub fn new(office: Arc<dyn Engine>, pdf: Arc<dyn Engine>, ocr: Arc<dyn Engine>) -> Self {
        Self { office, pdf, ocr }
    }

    /// Build the production dispatcher: all three engines as child processes.
    pub fn from_config(config: &EngineConfig) -> Self {
        let timeout = config.timeout();
        Self::new(
            Arc::new(OfficeEngine::new(&config.office_command, timeout)),
            Arc::new(PdfAnalyzerEngine::new(&config.pdf_command, timeout)),
            Arc::new(OcrEngine::new(&config.ocr_command, timeout)),
        )
    }

    /// Convert `input` according to `task_type`, writing artifacts under
    /// `output_dir`. Batch types treat `input` as a directory.
    pub async fn convert(
        &self,
        task_type: TaskType,
        input: &Path,
        output_dir: &Path,
        temp_dir: &Path,
        params: Option<&Value>,
    ) -> Result<ConversionResult, EngineError> {
        if task_type.is_batch() {
            self.batch_convert(task_type, input, output_dir, temp_dir, params)
                .await
        } else {
            self.single_convert(task_type, input, output_dir, temp_dir, params)
                .await
        }
    }

    async fn single_convert(
        &self,
        task_type: TaskType,
        input: &Path,
        output_dir: &Path,
        temp_dir: &Path,
        params: Option<&Value>,
    ) -> Result<ConversionResult, EngineError> {
        let request = EngineRequest {
            input,
            output_dir,
            temp_dir,
            params,
        };

        match task_type.per_file_kind() {
            TaskType::OfficeToPdf => self.run(&self.office, request).await,
            TaskType::PdfToMarkdown => {
                let stem = stem_of(input);
                let existing = output_dir.join(format!("{}.md", stem));
                if !param_flag(params, "force_reprocess") && path_exists(&existing).await {
                    info!(
                        "Reusing prior conversion artifacts for {} (force_reprocess off)",
                        input.display()
                    );
                    let output = scan_output_tree(output_dir, stem).await?;
                    return Ok(ConversionResult {
                        engine_name: self.pdf.name().to_string(),
                        output,
                        skipped: true,
                        batch: None,
                    });
                }
                self.run(&self.pdf, request).await
            }
            TaskType::OfficeToMarkdown => {
                // Compose office -> pdf -> markdown through the temp dir so
                // the intermediate PDF never pollutes the output tree.
                let office_request = EngineRequest {
                    input,
                    output_dir: temp_dir,
                    temp_dir,
                    params,
                };
                let rendered = self.run(&self.office, office_request).await?;

                let pdf_request = EngineRequest {
                    input: &rendered.output.primary,
                    output_dir,
                    temp_dir,
                    params,
                };
                let mut result = self.run(&self.pdf, pdf_request).await?;
                result.engine_name =
                    format!("{}+{}", self.office.name(), self.pdf.name());
                Ok(result)
            }
            TaskType::ImageToMarkdown => self.run(&self.ocr, request).await,
            batch => Err(EngineError::new(
                EngineErrorKind::Unknown,
                format!("{} is not a single-file task type", batch),
            )),
        }
    }

    /// Walk a directory (optionally recursively, optionally filtered by a
    /// filename regex) and convert every matching file into its own
    /// sub-directory of `output_dir`.
    async fn batch_convert(
        &self,
        task_type: TaskType,
        input_dir: &Path,
        output_dir: &Path,
        temp_dir: &Path,
        params: Option<&Value>,
    ) -> Result<ConversionResult, EngineError> {
        let pattern = match param_str(params, "file_pattern") {
            Some(raw) => Some(Regex::new(raw).map_err(|e| {
                EngineError::new(
                    EngineErrorKind::Unknown,
                    format!("invalid file_pattern: {}", e),
                )
            })?),
            None => None,
        };
        let recursive = param_flag(params, "recursive");
        let extensions = batch_extensions(task_type);

        let files =
            collect_batch_files(input_dir, recursive, extensions, pattern.as_ref()).await?;

        let mut summary = BatchSummary {
            total: files.len(),
            ..Default::default()
        };
        let mut aggregate = EngineOutput {
            primary: output_dir.to_path_buf(),
            ..Default::default()
        };

        for file in files {
            let stem = stem_of(&file).to_string();
            let file_output_dir = output_dir.join(&stem);
            if let Err(e) = tokio::fs::create_dir_all(&file_output_dir).await {
                summary.failed += 1;
                summary.failures.push((stem, e.to_string()));
                continue;
            }

            match self
                .single_convert(
                    task_type.per_file_kind(),
                    &file,
                    &file_output_dir,
                    temp_dir,
                    params,
                )
                .await
            {
                Ok(result) => {
                    summary.converted += 1;
                    aggregate
                        .markdown_files
                        .extend(result.output.markdown_files);
                    aggregate.json_files.extend(result.output.json_files);
                    aggregate.image_files.extend(result.output.image_files);
                }
                Err(e) => {
                    warn!("Batch conversion failed for {}: {}", file.display(), e);
                    summary.failed += 1;
                    summary.failures.push((
                        file.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| file.display().to_string()),
                        e.to_string(),
                    ));
                }
            }
        }

        if summary.converted == 0 && summary.failed > 0 {
            let first = summary
                .failures
                .first()
                .map(|(_, e)| e.clone())
                .unwrap_or_else(|| "all batch conversions failed".to_string());
            return Err(EngineError::classified(first));
        }

        info!(
            "Batch {} finished: {}/{} converted, {} failed",
            task_type, summary.converted, summary.total, summary.failed
        );

        Ok(ConversionResult {
            engine_name: self.engine_for(task_type).name().to_string(),
            output: aggregate,
            skipped: false,
            batch: Some(summary),
        })
    }

    fn engine_for(&self, task_type: TaskType) -> &Arc<dyn Engine> {
        match task_type.per_file_kind() {
            TaskType::OfficeToPdf => &self.office,
            TaskType::ImageToMarkdown => &self.ocr,
            _ => &self.pdf,
        }
    }

    /// Run one engine call and always release accelerator caches afterwards,
    /// successful or not.
    async fn run(
        &self,
        engine: &Arc<dyn Engine>,
        request: EngineRequest<'_>,
    ) -> Result<ConversionResult, EngineError> {
        let outcome = engine.convert(request).await;
        engine.clear_caches().await;

        outcome.map(|output| ConversionResult {
            engine_name: engine.name().to_string(),
            output,
            skipped: false,
            batch: None,
        })
    }
}

fn stem_of(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("output")
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn param_flag(params: Option<&Value>, name: &str) -> bool {
    match params.and_then(|p| p.get(name)) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

fn param_str<'a>(params: Option<&'a Value>, name: &str) -> Option<&'a str> {
    params.and_then(|p| p.get(name)).and_then(|v| v.as_str())
}

fn batch_extensions(task_type: TaskType) -> &'static [&'static str] {
    match task_type.per_file_kind() {
        TaskType::OfficeToPdf | TaskType::OfficeToMarkdown => {
            &["doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt"]
        }
        TaskType::PdfToMarkdown => &["pdf"],
        TaskType::ImageToMarkdown => &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"],
        _ => &[],
    }
}

async fn collect_batch_files(
    input_dir: &Path,
    recursive: bool,
    extensions: &[&str],
    pattern: Option<&Regex>,
) -> Result<Vec<PathBuf>, EngineError> {
    let io_err = |e: std::io::Error| EngineError::new(EngineErrorKind::Unknown, e.to_string());

    if !tokio::fs::try_exists(input_dir).await.map_err(io_err)? {
        return Err(EngineError::new(
            EngineErrorKind::InputNotFound,
            format!("batch input directory not found: {}", input_dir.display()),
        ));
    }

    let mut files = Vec::new();
    let mut stack = vec![input_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                if recursive {
                    stack.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let matches_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !matches_ext {
                continue;
            }

            if let Some(regex) = pattern {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                if !regex.is_match(name) {
                    continue;
                }
            }

            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `{stem}.md`, `{stem}.json`, and two images, like the real
    /// analyzer does.
    struct StubAnalyzer {
        calls: AtomicUsize,
    }

    impl StubAnalyzer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Engine for StubAnalyzer {
        fn name(&self) -> &'static str {
            "stub-analyzer"
        }

        async fn convert(
            &self,
            request: EngineRequest<'_>,
        ) -> Result<EngineOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stem = stem_of(request.input).to_string();
            let md = request.output_dir.join(format!("{}.md", stem));
            let json = request.output_dir.join(format!("{}.json", stem));
            let images = request.output_dir.join("images");
            tokio::fs::create_dir_all(&images).await.unwrap();
            tokio::fs::write(&md, b"# converted").await.unwrap();
            tokio::fs::write(&json, b"{}").await.unwrap();
            tokio::fs::write(images.join("a.png"), b"png").await.unwrap();
            tokio::fs::write(images.join("b.png"), b"png").await.unwrap();
            scan_output_tree(request.output_dir, &stem).await
        }
    }

    /// Renders a `{stem}.pdf` into the requested output dir.
    struct StubRenderer;

    #[async_trait]
    impl Engine for StubRenderer {
        fn name(&self) -> &'static str {
            "stub-renderer"
        }

        async fn convert(
            &self,
            request: EngineRequest<'_>,
        ) -> Result<EngineOutput, EngineError> {
            let pdf = request
                .output_dir
                .join(format!("{}.pdf", stem_of(request.input)));
            tokio::fs::write(&pdf, b"%PDF-1.4").await.unwrap();
            Ok(EngineOutput {
                primary: pdf,
                ..Default::default()
            })
        }
    }

    fn dispatcher(analyzer: Arc<StubAnalyzer>) -> ConversionDispatcher {
        ConversionDispatcher::new(Arc::new(StubRenderer), analyzer.clone(), analyzer)
    }

    async fn workspace() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        let temp = dir.path().join("temp");
        tokio::fs::create_dir_all(&output).await.unwrap();
        tokio::fs::create_dir_all(&temp).await.unwrap();
        (dir, output, temp)
    }

    #[tokio::test]
    async fn test_pdf_to_markdown_produces_tree() {
        let analyzer = StubAnalyzer::new();
        let dispatcher = dispatcher(analyzer.clone());
        let (dir, output, temp) = workspace().await;
        let input = dir.path().join("rep.pdf");
        tokio::fs::write(&input, b"%PDF-1.4").await.unwrap();

        let result = dispatcher
            .convert(TaskType::PdfToMarkdown, &input, &output, &temp, None)
            .await
            .unwrap();

        assert!(!result.skipped);
        assert_eq!(result.output.primary, output.join("rep.md"));
        assert_eq!(result.output.json_files.len(), 1);
        assert_eq!(result.output.image_files.len(), 2);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_if_artifacts_exist() {
        let analyzer = StubAnalyzer::new();
        let dispatcher = dispatcher(analyzer.clone());
        let (dir, output, temp) = workspace().await;
        let input = dir.path().join("rep.pdf");
        tokio::fs::write(&input, b"%PDF-1.4").await.unwrap();
        tokio::fs::write(output.join("rep.md"), b"# prior").await.unwrap();

        let result = dispatcher
            .convert(TaskType::PdfToMarkdown, &input, &output, &temp, None)
            .await
            .unwrap();

        assert!(result.skipped);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);

        // force_reprocess re-runs the engine
        let params = serde_json::json!({"force_reprocess": true});
        let result = dispatcher
            .convert(TaskType::PdfToMarkdown, &input, &output, &temp, Some(&params))
            .await
            .unwrap();
        assert!(!result.skipped);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_office_to_markdown_composes_through_temp() {
        let analyzer = StubAnalyzer::new();
        let dispatcher = dispatcher(analyzer.clone());
        let (dir, output, temp) = workspace().await;
        let input = dir.path().join("manual.docx");
        tokio::fs::write(&input, b"docx").await.unwrap();

        let result = dispatcher
            .convert(TaskType::OfficeToMarkdown, &input, &output, &temp, None)
            .await
            .unwrap();

        // Intermediate PDF stays in temp, markdown lands in output
        assert!(tokio::fs::try_exists(temp.join("manual.pdf")).await.unwrap());
        assert_eq!(result.output.primary, output.join("manual.md"));
        assert_eq!(result.engine_name, "stub-renderer+stub-analyzer");
    }

    #[tokio::test]
    async fn test_batch_walk_with_pattern() {
        let analyzer = StubAnalyzer::new();
        let dispatcher = dispatcher(analyzer.clone());
        let (dir, output, temp) = workspace().await;
        let input_dir = dir.path().join("input");
        tokio::fs::create_dir_all(input_dir.join("nested"))
            .await
            .unwrap();
        tokio::fs::write(input_dir.join("a.pdf"), b"pdf").await.unwrap();
        tokio::fs::write(input_dir.join("b.pdf"), b"pdf").await.unwrap();
        tokio::fs::write(input_dir.join("skip.txt"), b"txt").await.unwrap();
        tokio::fs::write(input_dir.join("nested/c.pdf"), b"pdf")
            .await
            .unwrap();

        // Non-recursive, regex keeps only a.pdf
        let params = serde_json::json!({"file_pattern": "^a\\."});
        let result = dispatcher
            .convert(
                TaskType::BatchPdfToMarkdown,
                &input_dir,
                &output,
                &temp,
                Some(&params),
            )
            .await
            .unwrap();
        let summary = result.batch.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.converted, 1);

        // Recursive without a pattern picks up the nested file too
        let params = serde_json::json!({"recursive": true});
        let result = dispatcher
            .convert(
                TaskType::BatchPdfToMarkdown,
                &input_dir,
                &output,
                &temp,
                Some(&params),
            )
            .await
            .unwrap();
        let summary = result.batch.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.converted, 3);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_batch_invalid_pattern() {
        let analyzer = StubAnalyzer::new();
        let dispatcher = dispatcher(analyzer);
        let (dir, output, temp) = workspace().await;
        let params = serde_json::json!({"file_pattern": "["});

        let err = dispatcher
            .convert(
                TaskType::BatchPdfToMarkdown,
                dir.path(),
                &output,
                &temp,
                Some(&params),
            )
            .await
            .unwrap_err();
        assert!(err.detail.contains("invalid file_pattern"));
    }
}
