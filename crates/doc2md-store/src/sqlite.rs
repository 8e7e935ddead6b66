//! SQLite task store backend.
//!
//! The default backend for single-instance deployments. An in-memory
//! database (`sqlite::memory:`) is supported for tests; it pins the pool to
//! one connection so every handle sees the same database.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use doc2md_core::{DocumentTask, TaskCreate, TaskFilter, TaskStatistics, TaskStatus};

use crate::{
    decode_json, decode_urls, encode_json, parse_priority, parse_status, parse_task_type,
    StoreError, TaskPatch, TaskStore, TASK_COLUMNS,
};

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Connect and run migrations. Accepts `sqlite://path` URLs and the
    /// `sqlite::memory:` form.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting to sqlite task store at {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true);

        // An in-memory database only exists per-connection, so the pool must
        // hold exactly one open connection for its whole lifetime.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePool::connect_with(options).await?
        };

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        debug!("Running task store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority TEXT NOT NULL DEFAULT 'normal',
                bucket_name TEXT,
                file_path TEXT,
                file_url TEXT,
                input_path TEXT,
                file_name TEXT,
                file_size_bytes INTEGER,
                output_path TEXT,
                output_url TEXT,
                s3_urls TEXT,
                params TEXT,
                result TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                task_processing_time REAL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retry_count INTEGER NOT NULL DEFAULT 3,
                last_retry_at TEXT,
                callback_url TEXT,
                callback_status_code INTEGER,
                callback_message TEXT,
                callback_time TEXT,
                platform TEXT,
                engine_name TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON document_tasks (status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON document_tasks (created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim \
             ON document_tasks (status, priority, created_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Task store migrations completed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_task(row: SqliteRow) -> Result<DocumentTask, StoreError> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;

    Ok(DocumentTask {
        id: row.try_get("id")?,
        task_type: parse_task_type(&task_type)?,
        status: parse_status(&status)?,
        priority: parse_priority(&priority)?,
        bucket_name: row.try_get("bucket_name")?,
        file_path: row.try_get("file_path")?,
        file_url: row.try_get("file_url")?,
        input_path: row.try_get("input_path")?,
        file_name: row.try_get("file_name")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        output_path: row.try_get("output_path")?,
        output_url: row.try_get("output_url")?,
        s3_urls: decode_urls(row.try_get("s3_urls")?)?,
        params: decode_json(row.try_get("params")?)?,
        result: decode_json(row.try_get("result")?)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        task_processing_time: row.try_get("task_processing_time")?,
        retry_count: row.try_get("retry_count")?,
        max_retry_count: row.try_get("max_retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        callback_url: row.try_get("callback_url")?,
        callback_status_code: row.try_get("callback_status_code")?,
        callback_message: row.try_get("callback_message")?,
        callback_time: row.try_get("callback_time")?,
        platform: row.try_get("platform")?,
        engine_name: row.try_get("engine_name")?,
    })
}

fn push_patch(qb: &mut QueryBuilder<'_, Sqlite>, patch: &TaskPatch) -> Result<(), StoreError> {
    if let Some(status) = patch.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(task_type) = patch.task_type {
        qb.push(", task_type = ").push_bind(task_type.as_str());
    }
    if let Some(ref val) = patch.input_path {
        qb.push(", input_path = ").push_bind(val.clone());
    }
    if let Some(ref val) = patch.output_path {
        qb.push(", output_path = ").push_bind(val.clone());
    }
    if let Some(ref val) = patch.file_name {
        qb.push(", file_name = ").push_bind(val.clone());
    }
    if let Some(val) = patch.file_size_bytes {
        qb.push(", file_size_bytes = ").push_bind(val);
    }
    if let Some(ref val) = patch.output_url {
        qb.push(", output_url = ").push_bind(val.clone());
    }
    if let Some(ref urls) = patch.s3_urls {
        let encoded = serde_json::to_string(urls)?;
        qb.push(", s3_urls = ").push_bind(encoded);
    }
    if let Some(ref val) = patch.result {
        qb.push(", result = ").push_bind(encode_json(val)?);
    }
    if let Some(ref val) = patch.error_message {
        qb.push(", error_message = ").push_bind(val.clone());
    }
    if let Some(ref val) = patch.engine_name {
        qb.push(", engine_name = ").push_bind(val.clone());
    }
    if let Some(val) = patch.retry_count {
        qb.push(", retry_count = ").push_bind(val);
    }
    if let Some(val) = patch.last_retry_at {
        qb.push(", last_retry_at = ").push_bind(val);
    }
    if let Some(val) = patch.started_at {
        qb.push(", started_at = ").push_bind(val);
    }
    if let Some(val) = patch.completed_at {
        qb.push(", completed_at = ").push_bind(val);
    }
    if let Some(val) = patch.task_processing_time {
        qb.push(", task_processing_time = ").push_bind(val);
    }
    if let Some(val) = patch.callback_status_code {
        qb.push(", callback_status_code = ").push_bind(val);
    }
    if let Some(ref val) = patch.callback_message {
        qb.push(", callback_message = ").push_bind(val.clone());
    }
    if let Some(val) = patch.callback_time {
        qb.push(", callback_time = ").push_bind(val);
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, create: &TaskCreate) -> Result<i64, StoreError> {
        let task_type = create
            .task_type
            .ok_or_else(|| StoreError::Database("task_type is required".to_string()))?;
        let params_json = create.params.as_ref().map(encode_json).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO document_tasks
                (task_type, status, priority, bucket_name, file_path, file_url,
                 input_path, output_path, params, callback_url, platform,
                 max_retry_count, created_at)
            VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_type.as_str())
        .bind(create.priority.as_str())
        .bind(&create.bucket_name)
        .bind(&create.file_path)
        .bind(&create.file_url)
        .bind(&create.input_path)
        .bind(&create.output_path)
        .bind(&params_json)
        .bind(&create.callback_url)
        .bind(&create.platform)
        .bind(create.max_retry_count.unwrap_or(3))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<DocumentTask>, StoreError> {
        let sql = format!("SELECT {} FROM document_tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(row_to_task).transpose()
    }

    async fn update(&self, id: i64, patch: TaskPatch) -> Result<bool, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE document_tasks SET updated_at = ");
        qb.push_bind(Utc::now());
        push_patch(&mut qb, &patch)?;
        qb.push(" WHERE id = ").push_bind(id);

        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(affected > 0)
    }

    async fn claim_pending(&self, id: i64) -> Result<bool, StoreError> {
        let now = Utc::now();
        let affected = sqlx::query(
            "UPDATE document_tasks SET status = 'processing', started_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn query(&self, filter: &TaskFilter) -> Result<Vec<DocumentTask>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM document_tasks WHERE 1 = 1",
            TASK_COLUMNS
        ));

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND priority = ").push_bind(priority.as_str());
        }
        if let Some(task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        if let Some(ref platform) = filter.platform {
            qb.push(" AND platform = ").push_bind(platform.clone());
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
        if let Some(has_result) = filter.has_result {
            qb.push(if has_result {
                " AND result IS NOT NULL"
            } else {
                " AND result IS NULL"
            });
        }
        if let Some(has_error) = filter.has_error {
            qb.push(if has_error {
                " AND error_message IS NOT NULL"
            } else {
                " AND error_message IS NULL"
            });
        }

        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit.max(1) as i64);
        qb.push(" OFFSET ").push_bind(filter.offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn fetch_claimable(&self, limit: u32) -> Result<Vec<DocumentTask>, StoreError> {
        let sql = format!(
            "SELECT {} FROM document_tasks WHERE status = 'pending' \
             ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END, \
             created_at ASC LIMIT ?",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_tasks WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn statistics(&self) -> Result<TaskStatistics, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM document_tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = TaskStatistics::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            stats.total_tasks += count;
            match parse_status(&status)? {
                TaskStatus::Pending => stats.pending_tasks = count,
                TaskStatus::Processing => stats.processing_tasks = count,
                TaskStatus::Completed => stats.completed_tasks = count,
                TaskStatus::Failed => stats.failed_tasks = count,
                TaskStatus::Cancelled => stats.cancelled_tasks = count,
            }
        }

        if stats.total_tasks > 0 {
            let rate = stats.completed_tasks as f64 / stats.total_tasks as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }

        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(task_processing_time) FROM document_tasks \
             WHERE task_processing_time IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.avg_processing_time = avg.map(|v| (v * 100.0).round() / 100.0);

        Ok(stats)
    }

    async fn delete_older_than(
        &self,
        days: u32,
        statuses: &[TaskStatus],
    ) -> Result<u64, StoreError> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(days as i64);
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM document_tasks WHERE created_at < ");
        qb.push_bind(cutoff);
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        qb.push(")");

        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Sqlite task store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc2md_core::{TaskPriority, TaskType};

    async fn memory_store() -> SqliteTaskStore {
        SqliteTaskStore::connect("sqlite::memory:").await.unwrap()
    }

    fn object_store_create(bucket: &str, key: &str) -> TaskCreate {
        TaskCreate {
            task_type: Some(TaskType::PdfToMarkdown),
            bucket_name: Some(bucket.to_string()),
            file_path: Some(key.to_string()),
            platform: Some("gaojiaqi".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();
        assert!(id > 0);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, TaskType::PdfToMarkdown);
        assert_eq!(task.bucket_name.as_deref(), Some("docs"));
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retry_count, 3);
        assert!(task.s3_urls.is_empty());

        assert!(store.get(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = memory_store().await;
        let first = store
            .create(&object_store_create("docs", "a.pdf"))
            .await
            .unwrap();
        let second = store
            .create(&object_store_create("docs", "b.pdf"))
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_claim_pending_cas() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();

        assert!(store.claim_pending(id).await.unwrap());
        // Second claim must lose the race
        assert!(!store.claim_pending(id).await.unwrap());

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_update_status_stamps() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();

        store.claim_pending(id).await.unwrap();
        store
            .update_status(id, TaskStatus::Completed, None)
            .await
            .unwrap();

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.started_at.unwrap() <= task.completed_at.unwrap());
        assert!(task.created_at <= task.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_patch_clears_error_and_sets_urls() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();

        store
            .update_status(id, TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let patch = TaskPatch {
            status: Some(TaskStatus::Pending),
            error_message: Some(None),
            retry_count: Some(0),
            s3_urls: Some(vec![
                "s3://ai-file/docs/rep/markdown/rep.md".to_string(),
                "s3://ai-file/docs/rep/markdown/rep.json".to_string(),
            ]),
            ..Default::default()
        };
        assert!(store.update(id, patch).await.unwrap());

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.error_message, None);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.s3_urls.len(), 2);
        assert!(task.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = memory_store().await;
        let patch = TaskPatch {
            retry_count: Some(1),
            ..Default::default()
        };
        assert!(!store.update(42, patch).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_claimable_priority_order() {
        let store = memory_store().await;

        let normal = store
            .create(&object_store_create("docs", "normal.pdf"))
            .await
            .unwrap();
        let low = store
            .create(&TaskCreate {
                priority: TaskPriority::Low,
                ..object_store_create("docs", "low.pdf")
            })
            .await
            .unwrap();
        let high = store
            .create(&TaskCreate {
                priority: TaskPriority::High,
                ..object_store_create("docs", "high.pdf")
            })
            .await
            .unwrap();

        let claimable = store.fetch_claimable(10).await.unwrap();
        let ids: Vec<i64> = claimable.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high, normal, low]);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();
        store
            .create(&TaskCreate {
                task_type: Some(TaskType::OfficeToPdf),
                ..object_store_create("docs", "deck.pptx")
            })
            .await
            .unwrap();

        let by_type = store
            .query(&TaskFilter {
                task_type: Some(TaskType::PdfToMarkdown),
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, id);

        let with_error = store
            .query(&TaskFilter {
                has_error: Some(true),
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(with_error.is_empty());

        let by_platform = store
            .query(&TaskFilter {
                platform: Some("gaojiaqi".to_string()),
                limit: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_platform.len(), 2);
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = memory_store().await;
        let a = store
            .create(&object_store_create("docs", "a.pdf"))
            .await
            .unwrap();
        let b = store
            .create(&object_store_create("docs", "b.pdf"))
            .await
            .unwrap();
        store
            .create(&object_store_create("docs", "c.pdf"))
            .await
            .unwrap();

        store.claim_pending(a).await.unwrap();
        store
            .update(
                a,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    completed_at: Some(Utc::now()),
                    task_processing_time: Some(2.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_status(b, TaskStatus::Failed, Some("engine failed"))
            .await
            .unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.pending_tasks, 1);
        assert!((stats.success_rate - 33.33).abs() < 0.01);
        assert_eq!(stats.avg_processing_time, Some(2.0));
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "old.pdf"))
            .await
            .unwrap();
        store
            .update_status(id, TaskStatus::Completed, None)
            .await
            .unwrap();

        // Backdate the row so it falls outside the retention window
        sqlx::query("UPDATE document_tasks SET created_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::days(40))
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();

        let removed = store
            .delete_older_than(30, &[TaskStatus::Completed, TaskStatus::Failed])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_rows_survive_by_status() {
        let store = memory_store().await;
        let id = store
            .create(&object_store_create("docs", "rep.pdf"))
            .await
            .unwrap();
        store.claim_pending(id).await.unwrap();

        let processing = store.by_status(TaskStatus::Processing, 100).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, id);
        assert_eq!(store.count_by_status(TaskStatus::Processing).await.unwrap(), 1);
    }
}
