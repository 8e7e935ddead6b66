// HTTP request handlers for the task API
//
// Validation happens here; lifecycle work happens in the scheduler. Handlers
// never hold state across awaits beyond the shared AppState.

use anyhow::anyhow;
use axum::{
    extract::{Multipart, Path as UrlPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::info;

use doc2md_core::{codec, TaskCreate, TaskFilter, TaskStatus, TaskType};
use doc2md_storage::{content_type_for, parse_url};
use doc2md_store::TaskPatch;

use crate::{AppError, AppState};

/// Characters percent-encoded inside the RFC 5987 filename*.
const DISPOSITION_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_');

/// POST /api/tasks/create - multipart form task creation
pub(crate) async fn create_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    if !state.scheduler.is_running() {
        return Err(AppError::with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            anyhow!("task scheduler is not running"),
        ));
    }

    let mut create = TaskCreate::default();
    let mut task_type_raw: Option<String> = None;
    let mut priority_raw: Option<String> = None;
    let mut params_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(anyhow!("invalid multipart form: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file_upload" {
            return Err(AppError::with_status(
                StatusCode::NOT_IMPLEMENTED,
                anyhow!("direct file upload is not supported; use input_path or bucket_name + file_path"),
            ));
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::bad_request(anyhow!("invalid form field {}: {}", name, e)))?;
        if value.is_empty() {
            continue;
        }

        match name.as_str() {
            "task_type" => task_type_raw = Some(value),
            "priority" => priority_raw = Some(value),
            "bucket_name" => create.bucket_name = Some(value),
            "file_path" => create.file_path = Some(value),
            "file_url" => create.file_url = Some(value),
            "input_path" => create.input_path = Some(value),
            "output_path" => create.output_path = Some(value),
            "params" => params_raw = Some(value),
            "callback_url" => create.callback_url = Some(value),
            "platform" => create.platform = Some(value),
            "max_retry_count" => {
                let parsed = value
                    .parse::<i32>()
                    .map_err(|_| AppError::bad_request(anyhow!("max_retry_count must be an integer")))?;
                create.max_retry_count = Some(parsed);
            }
            _ => {}
        }
    }

    let task_type: TaskType = task_type_raw
        .ok_or_else(|| AppError::bad_request(anyhow!("task_type is required")))?
        .parse()
        .map_err(|e: String| AppError::bad_request(anyhow!(e)))?;
    create.task_type = Some(task_type);

    if let Some(raw) = priority_raw {
        create.priority = raw
            .parse()
            .map_err(|e: String| AppError::bad_request(anyhow!(e)))?;
    }

    if let Some(raw) = params_raw {
        let params: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|_| AppError::bad_request(anyhow!("invalid params JSON")))?;
        if let Some(pattern) = params.get("file_pattern").and_then(|v| v.as_str()) {
            regex::Regex::new(pattern)
                .map_err(|e| AppError::bad_request(anyhow!("invalid file_pattern: {}", e)))?;
        }
        create.params = Some(params);
    }

    // Repair mojibake in the object key before it is ever persisted.
    if let Some(key) = create.file_path.take() {
        create.file_path = Some(codec::fix_encoding(&key));
    }

    create
        .validate()
        .map_err(|e| AppError::bad_request(anyhow!(e.to_string())))?;

    let task_id = state
        .store
        .create(&create)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;
    state.scheduler.enqueue(task_id);
    counter!("doc2md.tasks.created", 1);

    info!(
        task_id,
        task_type = %task_type,
        platform = create.platform.as_deref().unwrap_or(""),
        "Created conversion task"
    );

    Ok((
        StatusCode::OK,
        Json(json!({
            "task_id": task_id,
            "message": format!("Document conversion task {} created successfully", task_id),
            "status": "pending",
        })),
    )
        .into_response())
}

/// GET /api/tasks/:id - task view
pub(crate) async fn get_task(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Response, AppError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?
        .ok_or_else(|| AppError::not_found(anyhow!("task {} not found", id)))?;

    Ok(Json(task).into_response())
}

/// Query parameters for GET /api/tasks
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    status: Option<String>,
    priority: Option<String>,
    task_type: Option<String>,
    platform: Option<String>,
    created_after: Option<String>,
    created_before: Option<String>,
    has_result: Option<bool>,
    has_error: Option<bool>,
    limit: Option<u32>,
    offset: Option<u32>,
}

pub(crate) fn build_filter(query: ListQuery) -> Result<TaskFilter, String> {
    let mut filter = TaskFilter {
        limit: query.limit.unwrap_or(20).clamp(1, 100),
        offset: query.offset.unwrap_or(0),
        platform: query.platform,
        has_result: query.has_result,
        has_error: query.has_error,
        ..Default::default()
    };

    if let Some(raw) = query.status {
        filter.status = Some(raw.parse()?);
    }
    if let Some(raw) = query.priority {
        filter.priority = Some(raw.parse()?);
    }
    if let Some(raw) = query.task_type {
        filter.task_type = Some(raw.parse()?);
    }
    if let Some(raw) = query.created_after {
        filter.created_after = Some(parse_datetime(&raw)?);
    }
    if let Some(raw) = query.created_before {
        filter.created_before = Some(parse_datetime(&raw)?);
    }

    Ok(filter)
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("invalid datetime: {}", raw))
}

/// GET /api/tasks - filtered listing
pub(crate) async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let filter = build_filter(query).map_err(|e| AppError::bad_request(anyhow!(e)))?;
    let limit = filter.limit;
    let offset = filter.offset;

    let tasks = state
        .store
        .query(&filter)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;

    Ok(Json(json!({
        "count": tasks.len(),
        "limit": limit,
        "offset": offset,
        "tasks": tasks,
    }))
    .into_response())
}

/// POST /api/tasks/:id/retry - reset one failed/cancelled task
pub(crate) async fn retry_task(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
) -> Result<Response, AppError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?
        .ok_or_else(|| AppError::not_found(anyhow!("task {} not found", id)))?;

    if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
        return Err(AppError::bad_request(anyhow!(
            "task {} is {}; only failed or cancelled tasks can be retried",
            id,
            task.status
        )));
    }

    reset_for_retry(&state, id).await?;
    info!(task_id = id, "Task reset for retry");

    Ok(Json(json!({
        "task_id": id,
        "message": format!("Task {} queued for retry", id),
        "status": "pending",
    }))
    .into_response())
}

/// POST /api/tasks/retry-failed - bulk retry
pub(crate) async fn retry_failed_tasks(
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let failed = state
        .store
        .by_status(TaskStatus::Failed, 1000)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;

    let mut retried = Vec::new();
    for task in failed {
        reset_for_retry(&state, task.id).await?;
        retried.push(task.id);
    }

    info!("Bulk retry reset {} failed tasks", retried.len());

    Ok(Json(json!({
        "retried_count": retried.len(),
        "task_ids": retried,
        "message": format!("{} failed tasks queued for retry", retried.len()),
    }))
    .into_response())
}

async fn reset_for_retry(state: &AppState, id: i64) -> Result<(), AppError> {
    let patch = TaskPatch {
        status: Some(TaskStatus::Pending),
        retry_count: Some(0),
        error_message: Some(None),
        last_retry_at: Some(Utc::now()),
        ..Default::default()
    };
    state
        .store
        .update(id, patch)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;
    state.scheduler.enqueue(id);
    Ok(())
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateTaskTypeForm {
    new_task_type: String,
}

/// PUT /api/tasks/:id/task-type - change engine selection on a failed task
pub(crate) async fn update_task_type(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<i64>,
    Form(form): Form<UpdateTaskTypeForm>,
) -> Result<Response, AppError> {
    let new_type: TaskType = form
        .new_task_type
        .parse()
        .map_err(|e: String| AppError::bad_request(anyhow!(e)))?;

    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?
        .ok_or_else(|| AppError::not_found(anyhow!("task {} not found", id)))?;

    if task.status != TaskStatus::Failed {
        return Err(AppError::bad_request(anyhow!(
            "task {} is {}; only failed tasks can change type",
            id,
            task.status
        )));
    }

    let patch = TaskPatch {
        task_type: Some(new_type),
        ..Default::default()
    };
    state
        .store
        .update(id, patch)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;

    info!(task_id = id, "Task type changed to {}", new_type);

    Ok(Json(json!({
        "task_id": id,
        "message": format!("Task {} type changed to {}", id, new_type),
        "task_type": new_type.as_str(),
    }))
    .into_response())
}

/// GET /api/statistics - store + scheduler stats
pub(crate) async fn get_statistics(State(state): State<AppState>) -> Result<Response, AppError> {
    let store_stats = state
        .store
        .statistics()
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?;
    let scheduler_stats = state.scheduler.stats().await;

    Ok(Json(json!({
        "store": store_stats,
        "scheduler": scheduler_stats,
    }))
    .into_response())
}

/// GET /api/health - liveness + queue depths
pub(crate) async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.scheduler.is_running();
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if running { "healthy" } else { "unhealthy" },
            "is_running": running,
            "queue_depths": state.scheduler.queue_depths(),
        })),
    )
}

/// GET /api/download/:id/:filename - stream one uploaded artifact
pub(crate) async fn download_artifact(
    State(state): State<AppState>,
    UrlPath((id, filename)): UrlPath<(i64, String)>,
) -> Result<Response, AppError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(|e| AppError::internal(anyhow!(e)))?
        .ok_or_else(|| AppError::not_found(anyhow!("task {} not found", id)))?;

    let decoded = percent_decode_str(&filename)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| filename.clone());

    let url = find_artifact_url(&task.s3_urls, &filename, &decoded).ok_or_else(|| {
        AppError::not_found(anyhow!("artifact {} not found on task {}", decoded, id))
    })?;
    let (bucket, key) = parse_url(url)
        .ok_or_else(|| AppError::internal(anyhow!("stored artifact URL is unparseable: {}", url)))?;

    let bytes = state.gateway.read(&bucket, &key).await.map_err(|e| match e {
        doc2md_storage::GatewayError::NotFound { .. } => AppError::not_found(anyhow!(e)),
        other => AppError::internal(anyhow!(other)),
    })?;

    let content_type = content_type_for(Path::new(decoded.as_str()));
    let disposition = content_disposition(&decoded);

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Locate the `s3_urls` entry whose tail matches the requested name, raw or
/// URL-decoded.
pub(crate) fn find_artifact_url<'a>(
    urls: &'a [String],
    raw: &str,
    decoded: &str,
) -> Option<&'a String> {
    urls.iter().find(|url| {
        let tail = url.rsplit('/').next().unwrap_or(url);
        tail == raw || tail == decoded
    })
}

/// ASCII-safe Content-Disposition: a lossy ASCII fallback plus the RFC 5987
/// UTF-8 form.
pub(crate) fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, DISPOSITION_ENCODE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_parses_enums() {
        let filter = build_filter(ListQuery {
            status: Some("failed".into()),
            priority: Some("high".into()),
            task_type: Some("pdf_to_markdown".into()),
            limit: Some(500),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(filter.status, Some(TaskStatus::Failed));
        assert_eq!(filter.task_type, Some(TaskType::PdfToMarkdown));
        // limit clamps to the page cap
        assert_eq!(filter.limit, 100);

        assert!(build_filter(ListQuery {
            status: Some("exploded".into()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_build_filter_parses_dates() {
        let filter = build_filter(ListQuery {
            created_after: Some("2025-06-01T00:00:00Z".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(filter.created_after.is_some());

        assert!(build_filter(ListQuery {
            created_after: Some("last tuesday".into()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_find_artifact_url_accepts_decoded_names() {
        let urls = vec![
            "s3://ai-file/docs/rep/markdown/rep.md".to_string(),
            "s3://ai-file/docs/rep/markdown/2024手册.md".to_string(),
        ];

        assert_eq!(
            find_artifact_url(&urls, "rep.md", "rep.md"),
            Some(&urls[0])
        );
        // Percent-encoded request resolves through its decoded form
        assert_eq!(
            find_artifact_url(&urls, "2024%E6%89%8B%E5%86%8C.md", "2024手册.md"),
            Some(&urls[1])
        );
        assert_eq!(find_artifact_url(&urls, "missing.md", "missing.md"), None);
    }

    #[test]
    fn test_content_disposition_is_ascii() {
        let disposition = content_disposition("2024本科生学生手册.pdf");
        assert!(disposition.is_ascii());
        assert!(disposition.starts_with("attachment; filename=\""));
        assert!(disposition.contains("filename*=UTF-8''2024"));

        let plain = content_disposition("rep.md");
        assert!(plain.contains("filename=\"rep.md\""));
    }
}
