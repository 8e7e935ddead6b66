//! The seven worker kinds and the per-task pipeline.
//!
//! Coordinators (fetcher, merger, updater, cleaner, callback, GC) are
//! singletons; conversion workers form a pool of `max_concurrent_tasks`.
//! All of them suspend only at queue operations, store calls, and timed
//! waits, and exit when the shutdown token fires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, error, info, warn};

use doc2md_core::{codec, DocumentTask, SourceSpec, TaskPriority, TaskStatus};
use doc2md_storage::{conversion_metadata, derive_output_prefix, OutputKeySource};
use doc2md_store::{StoreError, TaskPatch};

use crate::{SchedulerCore, RECOVERY_MARKER};

/// Reset every `processing` row to `pending` before any worker runs. This is
/// what makes `processing` a recoverable state: a crash mid-conversion only
/// costs the attempt, never the task.
pub(crate) async fn recover_incomplete_tasks(core: &SchedulerCore) -> Result<usize, StoreError> {
    let interrupted = core.store.by_status(TaskStatus::Processing, 100).await?;
    let mut recovered = 0;
    for task in interrupted {
        match core
            .store
            .update_status(task.id, TaskStatus::Pending, Some(RECOVERY_MARKER))
            .await
        {
            Ok(true) => {
                debug!("Recovered task {} ({})", task.id, task.task_type);
                recovered += 1;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to recover task {}: {}", task.id, e),
        }
    }
    Ok(recovered)
}

/// Fetcher: polls the store for pending rows, claims up to the concurrency
/// budget via CAS, and routes claimed ids into the priority lanes. The
/// intake queue only wakes it early; the store decides what runs.
pub(crate) async fn fetcher_loop(core: Arc<SchedulerCore>) {
    let poll = core.config.poll_interval();
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
            _ = core.queues.intake.recv() => {}
        }
        if core.shutdown.is_cancelled() {
            break;
        }

        if let Err(e) = fetch_once(&core).await {
            // Transient store trouble: skip this poll, rows stay pending.
            warn!("Fetcher poll failed: {}", e);
        }
    }
    debug!("Fetcher stopped");
}

async fn fetch_once(core: &SchedulerCore) -> Result<(), StoreError> {
    let processing = core.store.count_by_status(TaskStatus::Processing).await?;
    let budget = core
        .config
        .max_concurrent_tasks
        .saturating_sub(processing as usize);
    if budget == 0 {
        return Ok(());
    }

    let claimable = core.store.fetch_claimable(budget as u32).await?;
    for task in claimable {
        match core.store.claim_pending(task.id).await {
            Ok(true) => {
                let lane = match task.priority {
                    TaskPriority::High => &core.queues.high,
                    TaskPriority::Normal => &core.queues.normal,
                    TaskPriority::Low => &core.queues.low,
                };
                if lane.send(task.id).await.is_err() {
                    return Ok(());
                }
            }
            // Row moved on between the query and the claim; skip silently.
            Ok(false) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Priority merger: strict priority selection into the dispatch queue.
/// Starvation of `low` under sustained `high` load is by design.
pub(crate) async fn merger_loop(core: Arc<SchedulerCore>) {
    loop {
        if core.shutdown.is_cancelled() {
            break;
        }

        let next = core
            .queues
            .high
            .try_recv()
            .or_else(|_| core.queues.normal.try_recv())
            .or_else(|_| core.queues.low.try_recv());

        match next {
            Ok(id) => {
                tokio::select! {
                    _ = core.shutdown.cancelled() => break,
                    result = core.queues.dispatch.send(id) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(_) => {
                tokio::select! {
                    _ = core.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!("Priority merger stopped");
}

/// One conversion worker: drains the dispatch queue and runs the full
/// pipeline for each task. The current conversion always finishes before a
/// shutdown is honored.
pub(crate) async fn conversion_worker_loop(core: Arc<SchedulerCore>, worker_id: usize) {
    info!("Conversion worker {} started", worker_id);
    loop {
        let id = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            received = core.queues.dispatch.recv() => match received {
                Ok(id) => id,
                Err(_) => break,
            }
        };

        process_one(&core, worker_id, id).await;
    }
    info!("Conversion worker {} stopped", worker_id);
}

async fn process_one(core: &SchedulerCore, worker_id: usize, task_id: i64) {
    let task = match core.store.get(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            warn!("Task {} vanished before processing", task_id);
            return;
        }
        Err(e) => {
            // Could not even read the row; hand the id back to the fetcher.
            warn!("Failed to load task {}: {}; re-queueing", task_id, e);
            let _ = core.queues.intake.send(task_id).await;
            return;
        }
    };

    info!(
        task_id,
        worker_id,
        task_type = %task.task_type,
        "Processing task"
    );
    counter!("doc2md.tasks.started", 1);
    let started = Instant::now();

    match run_pipeline(core, &task).await {
        Ok(outcome) => {
            let elapsed = started.elapsed().as_secs_f64();
            histogram!("doc2md.convert.seconds", elapsed);

            let patch = TaskPatch {
                status: Some(TaskStatus::Completed),
                completed_at: Some(Utc::now()),
                task_processing_time: Some(elapsed),
                output_url: outcome.output_url.clone(),
                s3_urls: Some(outcome.s3_urls),
                result: Some(outcome.result),
                engine_name: Some(outcome.engine_name),
                // A success after earlier retries must leave no stale error.
                error_message: Some(None),
                ..Default::default()
            };

            match core.store.update(task_id, patch).await {
                Ok(true) => {
                    counter!("doc2md.tasks.completed", 1);
                    info!(task_id, elapsed, "Task completed");
                    let _ = core.queues.update.send(task_id).await;
                }
                Ok(false) => warn!("Task {} row disappeared at terminal write", task_id),
                Err(e) => {
                    // Transient store failure on the terminal write: the work
                    // is done but unrecorded. Re-enter the pipeline without
                    // touching the retry counter.
                    warn!(
                        "Terminal write for task {} failed ({}); re-queueing",
                        task_id, e
                    );
                    let _ = core.queues.intake.send(task_id).await;
                }
            }
        }
        Err(message) => handle_task_error(core, task_id, &message).await,
    }
}

struct PipelineOutcome {
    output_url: Option<String>,
    s3_urls: Vec<String>,
    result: serde_json::Value,
    engine_name: String,
}

/// §4.6.1: workspace -> fetch input -> convert -> push outputs.
async fn run_pipeline(core: &SchedulerCore, task: &DocumentTask) -> Result<PipelineOutcome, String> {
    core.workspace
        .create(task.id)
        .await
        .map_err(|e| format!("workspace create failed: {}", e))?;

    let local_input = fetch_input(core, task).await?;

    let output_dir = core.workspace.output_dir(task.id);
    let temp_dir = core.workspace.temp_dir_for(task.id);
    let conversion = core
        .dispatcher
        .convert(
            task.task_type,
            &local_input,
            &output_dir,
            &temp_dir,
            task.params.as_ref(),
        )
        .await
        .map_err(|e| e.to_string())?;

    let _ = core
        .store
        .update(
            task.id,
            TaskPatch {
                output_path: Some(conversion.output.primary.display().to_string()),
                ..Default::default()
            },
        )
        .await;

    let upload = push_outputs(core, task, &conversion.output.primary).await?;

    let mut summary = json!({
        "conversion_type": task.task_type.as_str(),
        "engine": conversion.engine_name,
        "skipped_conversion": conversion.skipped,
        "uploaded_files": upload.s3_urls.len(),
        "total_size": upload.total_size,
    });
    if let Some(batch) = &conversion.batch {
        summary["batch"] = json!({
            "total": batch.total,
            "converted": batch.converted,
            "failed": batch.failed,
            "failures": batch.failures,
        });
    }

    Ok(PipelineOutcome {
        output_url: upload.output_url,
        s3_urls: upload.s3_urls,
        result: summary,
        engine_name: conversion.engine_name,
    })
}

/// §4.6.2: materialize the task's input inside its workspace.
async fn fetch_input(core: &SchedulerCore, task: &DocumentTask) -> Result<PathBuf, String> {
    match task.source_spec() {
        Some(SourceSpec::ObjectStore { bucket, key }) => {
            let filename = codec::decode_filename(key);
            let local = core.workspace.input_path(task.id, &filename);

            let downloaded = core
                .gateway
                .download(bucket, key, &local)
                .await
                .map_err(|e| format!("input fetch failed: {}", e))?;

            record_input(core, task.id, &local, &filename, downloaded.size as i64).await;
            Ok(local)
        }
        Some(SourceSpec::LocalPath(path)) => {
            let source = PathBuf::from(path);
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                return Err(format!("input fetch failed: local file not found: {}", path));
            }

            let filename = source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("task_{}_input", task.id));
            let local = core.workspace.input_path(task.id, &filename);

            // Copy, never move: the caller's file must not be consumed.
            tokio::fs::copy(&source, &local)
                .await
                .map_err(|e| format!("input fetch failed: {}", e))?;
            let size = tokio::fs::metadata(&local)
                .await
                .map(|m| m.len() as i64)
                .unwrap_or(0);

            record_input(core, task.id, &local, &filename, size).await;
            Ok(local)
        }
        Some(SourceSpec::FileUrl(url)) => {
            Err(format!("input fetch failed: http source not implemented: {}", url))
        }
        None => Err("input fetch failed: no input source specified".to_string()),
    }
}

async fn record_input(
    core: &SchedulerCore,
    task_id: i64,
    local: &std::path::Path,
    name: &str,
    size: i64,
) {
    let patch = TaskPatch {
        input_path: Some(local.display().to_string()),
        file_name: Some(name.to_string()),
        file_size_bytes: Some(size),
        ..Default::default()
    };
    if let Err(e) = core.store.update(task_id, patch).await {
        warn!("Failed to record input fields for task {}: {}", task_id, e);
    }
}

struct UploadOutcome {
    output_url: Option<String>,
    s3_urls: Vec<String>,
    total_size: u64,
}

/// §4.6.3: upload the output tree (or its single file) under the derived
/// prefix. `s3_urls` comes back in lexical relative-path order.
async fn push_outputs(
    core: &SchedulerCore,
    task: &DocumentTask,
    primary_artifact: &std::path::Path,
) -> Result<UploadOutcome, String> {
    let output_dir = core.workspace.output_dir(task.id);
    let bucket = core.gateway.upload_bucket().to_string();

    let source = OutputKeySource {
        bucket: task.bucket_name.as_deref(),
        key: task.file_path.as_deref(),
        platform: task.platform.as_deref(),
        input_path: task.input_path.as_deref(),
    };
    let prefix = derive_output_prefix(&source, task.task_type, task.id, &bucket);

    let original_filename = task
        .file_name
        .clone()
        .or_else(|| task.file_path.as_deref().map(|k| basename(k).to_string()))
        .or_else(|| task.input_path.as_deref().map(|p| basename(p).to_string()));
    let original_folder = task
        .file_path
        .as_deref()
        .map(folder_of)
        .filter(|f| !f.is_empty());
    let metadata = conversion_metadata(
        task.id,
        task.task_type,
        original_filename.as_deref(),
        original_folder.as_deref(),
        task.bucket_name.as_deref(),
    );

    // Multiple files, an images/ tree, or an intermediate .json mean the
    // whole directory is the artifact. Batch outputs are always a tree.
    let shape = inspect_output_dir(&output_dir)
        .await
        .map_err(|e| format!("upload failed: {}", e))?;

    if task.task_type.is_batch() || shape.entries > 1 || shape.has_images || shape.has_json {
        let result = core
            .gateway
            .upload_directory(&output_dir, &bucket, &prefix, &metadata)
            .await
            .map_err(|e| format!("upload failed: {}", e))?;

        if !result.success() {
            let first = result
                .failed
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(format!("upload failed: {}", first));
        }

        let primary = result
            .uploaded
            .iter()
            .find(|f| f.relative_path.ends_with(".md"))
            .or_else(|| result.uploaded.iter().max_by_key(|f| f.size))
            .map(|f| f.s3_url.clone());

        Ok(UploadOutcome {
            output_url: primary,
            s3_urls: result.uploaded.iter().map(|f| f.s3_url.clone()).collect(),
            total_size: result.total_size,
        })
    } else {
        let filename = primary_artifact
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| "upload failed: output has no filename".to_string())?;
        let key = format!("{}/{}", prefix, filename);

        let uploaded = core
            .gateway
            .upload_file(primary_artifact, &bucket, &key, &metadata)
            .await
            .map_err(|e| format!("upload failed: {}", e))?;

        Ok(UploadOutcome {
            output_url: Some(uploaded.http_url.unwrap_or_else(|| uploaded.s3_url.clone())),
            s3_urls: vec![uploaded.s3_url],
            total_size: uploaded.size,
        })
    }
}

struct OutputShape {
    entries: usize,
    has_images: bool,
    has_json: bool,
}

async fn inspect_output_dir(dir: &std::path::Path) -> std::io::Result<OutputShape> {
    let mut shape = OutputShape {
        entries: 0,
        has_images: false,
        has_json: false,
    };
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        shape.entries += 1;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && name == "images" {
            shape.has_images = true;
        }
        if !is_dir && name.to_lowercase().ends_with(".json") {
            shape.has_json = true;
        }
    }
    Ok(shape)
}

/// §4.6.4: bump the retry counter; re-enter the pipeline or fail for good.
async fn handle_task_error(core: &SchedulerCore, task_id: i64, message: &str) {
    let task = match core.store.get(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to load task {} for error handling: {}", task_id, e);
            let _ = core.queues.intake.send(task_id).await;
            return;
        }
    };

    let retry_count = task.retry_count + 1;
    if retry_count < task.max_retry_count {
        let patch = TaskPatch {
            status: Some(TaskStatus::Pending),
            retry_count: Some(retry_count),
            last_retry_at: Some(Utc::now()),
            error_message: Some(Some(message.to_string())),
            ..Default::default()
        };
        match core.store.update(task_id, patch).await {
            Ok(_) => {
                counter!("doc2md.tasks.retried", 1);
                warn!(
                    task_id,
                    retry_count,
                    max = task.max_retry_count,
                    "Task failed, re-queued: {}",
                    message
                );
                let _ = core.queues.intake.send(task_id).await;
            }
            Err(e) => {
                warn!("Failed to persist retry for task {}: {}", task_id, e);
                let _ = core.queues.intake.send(task_id).await;
            }
        }
    } else {
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            retry_count: Some(retry_count),
            completed_at: Some(Utc::now()),
            error_message: Some(Some(message.to_string())),
            ..Default::default()
        };
        match core.store.update(task_id, patch).await {
            Ok(_) => {
                counter!("doc2md.tasks.failed", 1);
                error!(
                    task_id,
                    retry_count, "Task failed permanently: {}", message
                );
                let _ = core.queues.update.send(task_id).await;
            }
            Err(e) => {
                warn!("Failed to persist failure for task {}: {}", task_id, e);
                let _ = core.queues.intake.send(task_id).await;
            }
        }
    }
}

/// Updater: post-commit bookkeeping. Deliberately thin; it keeps the stage
/// chain composable for future hooks.
pub(crate) async fn updater_loop(core: Arc<SchedulerCore>) {
    loop {
        let id = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            received = core.queues.update.recv() => match received {
                Ok(id) => id,
                Err(_) => break,
            }
        };

        debug!("Post-commit bookkeeping for task {}", id);
        let _ = core.queues.cleanup.send(id).await;
    }
    debug!("Updater stopped");
}

/// Cleaner: drop engine scratch while preserving inputs and artifacts.
pub(crate) async fn cleaner_loop(core: Arc<SchedulerCore>) {
    loop {
        let id = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            received = core.queues.cleanup.recv() => match received {
                Ok(id) => id,
                Err(_) => break,
            }
        };

        if let Err(e) = core.workspace.partial_cleanup(id).await {
            warn!("Partial cleanup for task {} failed: {}", id, e);
        }
        let _ = core.queues.callback.send(id).await;
    }
    debug!("Cleaner stopped");
}

/// Callback: POST the public task view to the caller's URL with bounded
/// retries. A callback failure is recorded on the row but never changes the
/// task status.
pub(crate) async fn callback_loop(core: Arc<SchedulerCore>) {
    loop {
        let id = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            received = core.queues.callback.recv() => match received {
                Ok(id) => id,
                Err(_) => break,
            }
        };

        let task = match core.store.get(id).await {
            Ok(Some(task)) => task,
            _ => continue,
        };
        let Some(url) = task.callback_url.clone() else {
            continue;
        };

        deliver_callback(&core, id, &url, &task).await;
    }
    debug!("Callback worker stopped");
}

async fn deliver_callback(core: &SchedulerCore, id: i64, url: &str, task: &DocumentTask) {
    let max_attempts = core.callback.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match core.http.post(url).json(task).send().await {
            Ok(response) => {
                let status = response.status();
                let message = if status.is_success() {
                    "delivered".to_string()
                } else {
                    format!("callback returned {}", status)
                };
                let _ = core
                    .store
                    .record_callback(id, Some(status.as_u16() as i32), &message)
                    .await;
                if status.is_success() {
                    counter!("doc2md.callbacks.delivered", 1);
                    debug!("Callback for task {} delivered to {}", id, url);
                    return;
                }
            }
            Err(e) => {
                if attempt == max_attempts {
                    counter!("doc2md.callbacks.failed", 1);
                    warn!("Callback for task {} failed after {} attempts: {}", id, attempt, e);
                    let _ = core
                        .store
                        .record_callback(id, None, &format!("callback failed: {}", e))
                        .await;
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
    }
}

/// GC: prune aged temp files and, when retention is enabled, old terminal
/// rows.
pub(crate) async fn gc_loop(core: Arc<SchedulerCore>) {
    let interval = core.config.gc_interval();
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if core.shutdown.is_cancelled() {
            break;
        }

        match core.workspace.gc_temp_files(Duration::from_secs(24 * 3600)).await {
            Ok(removed) if removed > 0 => info!("GC: removed {} temp files", removed),
            Ok(_) => {}
            Err(e) => warn!("GC temp file pass failed: {}", e),
        }

        if core.config.retention_days > 0 {
            match core
                .store
                .delete_older_than(
                    core.config.retention_days,
                    &[TaskStatus::Completed, TaskStatus::Failed],
                )
                .await
            {
                Ok(removed) if removed > 0 => info!("GC: pruned {} old task rows", removed),
                Ok(_) => {}
                Err(e) => warn!("GC retention pass failed: {}", e),
            }
        }
    }
    debug!("GC worker stopped");
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn folder_of(key: &str) -> String {
    match key.rfind('/') {
        Some(idx) => key[..idx].to_string(),
        None => String::new(),
    }
}
