//! Headless Office renderer engine.
//!
//! One-shot `soffice --headless --convert-to pdf` invocation per document.
//! LibreOffice names its output `{stem}.pdf` inside the requested outdir.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::exec::CommandRunner;
use crate::{Engine, EngineError, EngineErrorKind, EngineOutput, EngineRequest};

pub struct OfficeEngine {
    command: String,
    runner: CommandRunner,
}

impl OfficeEngine {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            runner: CommandRunner::new(timeout),
        }
    }
}

#[async_trait]
impl Engine for OfficeEngine {
    fn name(&self) -> &'static str {
        "libreoffice"
    }

    async fn convert(&self, request: EngineRequest<'_>) -> Result<EngineOutput, EngineError> {
        let input = request.input.to_str().ok_or_else(|| {
            EngineError::new(EngineErrorKind::Unknown, "input path is not valid UTF-8")
        })?;
        let outdir = request.output_dir.to_str().ok_or_else(|| {
            EngineError::new(EngineErrorKind::Unknown, "output path is not valid UTF-8")
        })?;

        self.runner
            .run(
                &self.command,
                &["--headless", "--convert-to", "pdf", "--outdir", outdir, input],
                Some(request.temp_dir),
            )
            .await?;

        let stem = request
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let produced = request.output_dir.join(format!("{}.pdf", stem));

        if !tokio::fs::try_exists(&produced)
            .await
            .map_err(|e| EngineError::new(EngineErrorKind::Unknown, e.to_string()))?
        {
            return Err(EngineError::new(
                EngineErrorKind::Unknown,
                format!("renderer produced no output for {}", input),
            ));
        }

        info!("Rendered {} -> {}", input, produced.display());

        Ok(EngineOutput {
            primary: produced,
            ..Default::default()
        })
    }
}
