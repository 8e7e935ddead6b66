//! Analyzer engines: PDF-to-Markdown and OCR.
//!
//! Both wrap an external analyzer command that is handed the input file and
//! an output directory. The PDF analyzer is expected to leave `{stem}.md`,
//! an intermediate `{stem}.json`, and an `images/` directory with extracted
//! figures; the OCR engine produces a single `{stem}.md`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::exec::CommandRunner;
use crate::{Engine, EngineError, EngineErrorKind, EngineOutput, EngineRequest};

pub struct PdfAnalyzerEngine {
    command: String,
    runner: CommandRunner,
}

impl PdfAnalyzerEngine {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            runner: CommandRunner::new(timeout),
        }
    }
}

#[async_trait]
impl Engine for PdfAnalyzerEngine {
    fn name(&self) -> &'static str {
        "pdf-analyzer"
    }

    async fn convert(&self, request: EngineRequest<'_>) -> Result<EngineOutput, EngineError> {
        let input = path_str(request.input)?;
        let outdir = path_str(request.output_dir)?;

        self.runner
            .run(
                &self.command,
                &["-p", input, "-o", outdir],
                Some(request.temp_dir),
            )
            .await?;

        let stem = stem_of(request.input);
        let output = scan_output_tree(request.output_dir, stem).await?;
        info!(
            "Analyzed {} -> {} ({} markdown, {} json, {} images)",
            input,
            output.primary.display(),
            output.markdown_files.len(),
            output.json_files.len(),
            output.image_files.len()
        );
        Ok(output)
    }
}

pub struct OcrEngine {
    command: String,
    runner: CommandRunner,
}

impl OcrEngine {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            runner: CommandRunner::new(timeout),
        }
    }
}

#[async_trait]
impl Engine for OcrEngine {
    fn name(&self) -> &'static str {
        "ocr-analyzer"
    }

    async fn convert(&self, request: EngineRequest<'_>) -> Result<EngineOutput, EngineError> {
        let input = path_str(request.input)?;
        let outdir = path_str(request.output_dir)?;

        self.runner
            .run(
                &self.command,
                &["--method", "ocr", "-p", input, "-o", outdir],
                Some(request.temp_dir),
            )
            .await?;

        let stem = stem_of(request.input);
        let markdown = request.output_dir.join(format!("{}.md", stem));
        if !exists(&markdown).await? {
            return Err(EngineError::new(
                EngineErrorKind::Unknown,
                format!("OCR produced no markdown for {}", input),
            ));
        }

        Ok(EngineOutput {
            primary: markdown.clone(),
            markdown_files: vec![markdown],
            ..Default::default()
        })
    }
}

fn path_str(path: &Path) -> Result<&str, EngineError> {
    path.to_str()
        .ok_or_else(|| EngineError::new(EngineErrorKind::Unknown, "path is not valid UTF-8"))
}

fn stem_of(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("output")
}

async fn exists(path: &Path) -> Result<bool, EngineError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| EngineError::new(EngineErrorKind::Unknown, e.to_string()))
}

/// Collect the analyzer's artifacts for one document: the markdown file is
/// required, the JSON structure and extracted images are optional.
pub(crate) async fn scan_output_tree(
    output_dir: &Path,
    stem: &str,
) -> Result<EngineOutput, EngineError> {
    let markdown = output_dir.join(format!("{}.md", stem));
    if !exists(&markdown).await? {
        return Err(EngineError::new(
            EngineErrorKind::Unknown,
            format!("analyzer produced no markdown for stem {}", stem),
        ));
    }

    let mut output = EngineOutput {
        primary: markdown.clone(),
        markdown_files: vec![markdown],
        ..Default::default()
    };

    let json = output_dir.join(format!("{}.json", stem));
    if exists(&json).await? {
        output.json_files.push(json);
    }

    let images_dir = output_dir.join("images");
    if exists(&images_dir).await? {
        let mut entries = tokio::fs::read_dir(&images_dir)
            .await
            .map_err(|e| EngineError::new(EngineErrorKind::Unknown, e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::new(EngineErrorKind::Unknown, e.to_string()))?
        {
            if entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false)
            {
                output.image_files.push(entry.path());
            }
        }
        output.image_files.sort();
    }

    Ok(output)
}
