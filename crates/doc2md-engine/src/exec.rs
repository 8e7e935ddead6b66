//! Child-process runner shared by the subprocess engines.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{EngineError, EngineErrorKind};

/// Runs an engine binary with a hard timeout. A timed-out child is killed,
/// not abandoned.
#[derive(Debug, Clone)]
pub(crate) struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(crate) async fn run(
        &self,
        program: &str,
        args: &[&str],
        working_dir: Option<&Path>,
    ) -> Result<String, EngineError> {
        debug!("Running engine command: {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::new(
                    EngineErrorKind::MissingDependency,
                    format!("engine binary not found: {}", program),
                )
            } else {
                EngineError::new(EngineErrorKind::Unknown, e.to_string())
            }
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| EngineError::new(EngineErrorKind::Unknown, e.to_string()))?,
            Err(_) => {
                return Err(EngineError::new(
                    EngineErrorKind::Timeout,
                    format!(
                        "{} exceeded the {}s engine timeout",
                        program,
                        self.timeout.as_secs()
                    ),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let combined = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            let detail = if combined.is_empty() {
                format!("{} exited with {}", program, output.status)
            } else {
                combined
            };
            return Err(EngineError::classified(detail));
        }

        Ok(stdout.into_owned())
    }
}
