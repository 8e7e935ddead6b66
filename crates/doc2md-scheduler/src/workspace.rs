//! Per-task scratch workspaces.
//!
//! Every task owns `<base>/task_{id}/` with `input/`, `output/`, and `temp/`
//! sub-directories. Final artifacts in `output/` outlive the worker phase so
//! the download proxy can serve them; only explicit task deletion removes a
//! workspace. A process-wide temp dir holds engine scratch files that the GC
//! worker prunes by age.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use doc2md_config::WorkspaceConfig;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    temp_dir: PathBuf,
}

/// Counters for the statistics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceStats {
    pub active_task_workspaces: u64,
    pub total_workspace_bytes: u64,
    pub temp_files_count: u64,
    pub temp_files_bytes: u64,
}

impl WorkspaceManager {
    /// Create the manager and ensure the base and temp directories exist
    /// with 0755 permissions.
    pub async fn new(config: &WorkspaceConfig) -> io::Result<Self> {
        let manager = Self {
            base_dir: PathBuf::from(&config.base_dir),
            temp_dir: PathBuf::from(&config.temp_dir),
        };

        tokio::fs::create_dir_all(&manager.base_dir).await?;
        tokio::fs::create_dir_all(&manager.temp_dir).await?;
        set_dir_mode(&manager.base_dir).await?;
        set_dir_mode(&manager.temp_dir).await?;

        info!(
            "Workspace manager ready - base: {}, temp: {}",
            manager.base_dir.display(),
            manager.temp_dir.display()
        );
        Ok(manager)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn task_workspace(&self, task_id: i64) -> PathBuf {
        self.base_dir.join(format!("task_{}", task_id))
    }

    pub fn input_dir(&self, task_id: i64) -> PathBuf {
        self.task_workspace(task_id).join("input")
    }

    pub fn output_dir(&self, task_id: i64) -> PathBuf {
        self.task_workspace(task_id).join("output")
    }

    pub fn temp_dir_for(&self, task_id: i64) -> PathBuf {
        self.task_workspace(task_id).join("temp")
    }

    /// Pure path computation; never touches disk.
    pub fn input_path(&self, task_id: i64, filename: &str) -> PathBuf {
        self.input_dir(task_id).join(filename)
    }

    pub fn output_path(&self, task_id: i64, filename: &str) -> PathBuf {
        self.output_dir(task_id).join(filename)
    }

    pub fn temp_path(&self, task_id: i64, filename: &str) -> PathBuf {
        self.temp_dir_for(task_id).join(filename)
    }

    /// Idempotent creation of the three sub-directories.
    pub async fn create(&self, task_id: i64) -> io::Result<PathBuf> {
        let workspace = self.task_workspace(task_id);
        for sub in ["input", "output", "temp"] {
            let dir = workspace.join(sub);
            tokio::fs::create_dir_all(&dir).await?;
            set_dir_mode(&dir).await?;
        }
        set_dir_mode(&workspace).await?;
        debug!("Created task workspace: {}", workspace.display());
        Ok(workspace)
    }

    /// Remove engine scratch: everything under `temp/`, and any sub-directory
    /// of `output/` whose name contains "temp". Never deletes `input/` or
    /// final artifacts in `output/`.
    pub async fn partial_cleanup(&self, task_id: i64) -> io::Result<()> {
        let temp = self.temp_dir_for(task_id);
        if tokio::fs::try_exists(&temp).await? {
            let mut entries = tokio::fs::read_dir(&temp).await?;
            while let Some(entry) = entries.next_entry().await? {
                remove_entry(&entry).await?;
            }
            debug!("Cleaned temp files for task {}", task_id);
        }

        let output = self.output_dir(task_id);
        if tokio::fs::try_exists(&output).await? {
            let mut entries = tokio::fs::read_dir(&output).await?;
            while let Some(entry) = entries.next_entry().await? {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if is_dir && name.contains("temp") {
                    tokio::fs::remove_dir_all(entry.path()).await?;
                    debug!("Cleaned temp output dir: {}", name);
                }
            }
        }

        Ok(())
    }

    /// Delete the whole workspace. Only explicit task deletion does this.
    pub async fn remove(&self, task_id: i64) -> io::Result<()> {
        let workspace = self.task_workspace(task_id);
        if tokio::fs::try_exists(&workspace).await? {
            tokio::fs::remove_dir_all(&workspace).await?;
            info!("Removed task workspace: {}", workspace.display());
        }
        Ok(())
    }

    /// Prune process-wide temp files older than `max_age`. Returns how many
    /// files were removed.
    pub async fn gc_temp_files(&self, max_age: Duration) -> io::Result<usize> {
        if !tokio::fs::try_exists(&self.temp_dir).await? {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.temp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to delete temp file {:?}: {}", entry.path(), e),
                }
            }
        }

        if removed > 0 {
            info!("GC removed {} aged temp files", removed);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> WorkspaceStats {
        let mut stats = WorkspaceStats::default();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && name.starts_with("task_") {
                    stats.active_task_workspaces += 1;
                    stats.total_workspace_bytes += dir_size(&entry.path()).await;
                }
            }
        }

        if let Ok(mut entries) = tokio::fs::read_dir(&self.temp_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    stats.temp_files_count += 1;
                    stats.temp_files_bytes +=
                        entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                }
            }
        }

        stats
    }
}

async fn remove_entry(entry: &tokio::fs::DirEntry) -> io::Result<()> {
    let path = entry.path();
    if entry.file_type().await?.is_dir() {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    }
}

async fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(t) if t.is_dir() => stack.push(entry.path()),
                Ok(t) if t.is_file() => {
                    total += entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                }
                _ => {}
            }
        }
    }
    total
}

#[cfg(unix)]
async fn set_dir_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o755);
    tokio::fs::set_permissions(path, permissions).await
}

#[cfg(not(unix))]
async fn set_dir_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig {
            base_dir: dir.path().join("workspaces").display().to_string(),
            temp_dir: dir.path().join("temp").display().to_string(),
        };
        let manager = WorkspaceManager::new(&config).await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_guard, manager) = manager().await;
        let first = manager.create(42).await.unwrap();
        let second = manager.create(42).await.unwrap();
        assert_eq!(first, second);

        for sub in ["input", "output", "temp"] {
            assert!(first.join(sub).is_dir());
        }
    }

    #[tokio::test]
    async fn test_path_computation_is_pure() {
        let (_guard, manager) = manager().await;
        let path = manager.input_path(7, "2024本科生学生手册.pdf");
        assert!(path.ends_with("task_7/input/2024本科生学生手册.pdf"));
        // No workspace was created by computing the path
        assert!(!manager.task_workspace(7).exists());
    }

    #[tokio::test]
    async fn test_partial_cleanup_preserves_artifacts() {
        let (_guard, manager) = manager().await;
        manager.create(1).await.unwrap();

        tokio::fs::write(manager.input_path(1, "in.pdf"), b"in")
            .await
            .unwrap();
        tokio::fs::write(manager.output_path(1, "rep.md"), b"# md")
            .await
            .unwrap();
        tokio::fs::write(manager.temp_path(1, "scratch.bin"), b"x")
            .await
            .unwrap();
        let engine_scratch = manager.output_dir(1).join("temp_mineru_output");
        tokio::fs::create_dir_all(&engine_scratch).await.unwrap();
        tokio::fs::write(engine_scratch.join("page.json"), b"{}")
            .await
            .unwrap();

        manager.partial_cleanup(1).await.unwrap();

        assert!(manager.input_path(1, "in.pdf").exists());
        assert!(manager.output_path(1, "rep.md").exists());
        assert!(!manager.temp_path(1, "scratch.bin").exists());
        assert!(!engine_scratch.exists());
        // The directories themselves survive
        assert!(manager.temp_dir_for(1).is_dir());
    }

    #[tokio::test]
    async fn test_gc_temp_files_by_age() {
        let (_guard, manager) = manager().await;
        let temp_file = manager.temp_dir.join("stale.tmp");
        tokio::fs::write(&temp_file, b"x").await.unwrap();

        // Everything is younger than the cutoff
        assert_eq!(manager.gc_temp_files(Duration::from_secs(3600)).await.unwrap(), 0);
        // Zero cutoff removes it
        assert_eq!(manager.gc_temp_files(Duration::ZERO).await.unwrap(), 1);
        assert!(!temp_file.exists());
    }

    #[tokio::test]
    async fn test_stats_counts_workspaces() {
        let (_guard, manager) = manager().await;
        manager.create(1).await.unwrap();
        manager.create(2).await.unwrap();
        tokio::fs::write(manager.output_path(1, "rep.md"), b"12345")
            .await
            .unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.active_task_workspaces, 2);
        assert_eq!(stats.total_workspace_bytes, 5);
    }
}
