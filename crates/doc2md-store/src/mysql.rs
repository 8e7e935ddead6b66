//! MySQL task store backend.
//!
//! Used when several orchestrator instances share one relational store.
//! Schema and semantics are identical to the SQLite backend; only the DDL
//! and datetime mapping differ (`DATETIME(6)` columns, naive UTC values).

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use tracing::{debug, info};

use doc2md_core::{DocumentTask, TaskCreate, TaskFilter, TaskStatistics, TaskStatus};

use crate::{
    decode_json, decode_urls, encode_json, parse_priority, parse_status, parse_task_type,
    StoreError, TaskPatch, TaskStore, TASK_COLUMNS,
};

pub struct MySqlTaskStore {
    pool: MySqlPool,
}

impl MySqlTaskStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting to mysql task store");

        let pool = MySqlPool::connect(url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        debug!("Running task store migrations");

        // MySQL has no CREATE INDEX IF NOT EXISTS; indexes ride along with
        // the table definition instead.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_tasks (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                task_type VARCHAR(50) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                priority VARCHAR(20) NOT NULL DEFAULT 'normal',
                bucket_name VARCHAR(255),
                file_path TEXT,
                file_url TEXT,
                input_path TEXT,
                file_name VARCHAR(255),
                file_size_bytes BIGINT,
                output_path TEXT,
                output_url VARCHAR(500),
                s3_urls TEXT,
                params TEXT,
                result TEXT,
                error_message TEXT,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6),
                started_at DATETIME(6),
                completed_at DATETIME(6),
                task_processing_time DOUBLE,
                retry_count INT NOT NULL DEFAULT 0,
                max_retry_count INT NOT NULL DEFAULT 3,
                last_retry_at DATETIME(6),
                callback_url VARCHAR(500),
                callback_status_code INT,
                callback_message VARCHAR(512),
                callback_time DATETIME(6),
                platform VARCHAR(50),
                engine_name VARCHAR(50),
                INDEX idx_tasks_status (status),
                INDEX idx_tasks_created_at (created_at),
                INDEX idx_tasks_claim (status, priority, created_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Task store migrations completed");
        Ok(())
    }
}

fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn to_utc(naive: Option<NaiveDateTime>) -> Option<chrono::DateTime<Utc>> {
    naive.map(|n| n.and_utc())
}

fn row_to_task(row: MySqlRow) -> Result<DocumentTask, StoreError> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let created_at: NaiveDateTime = row.try_get("created_at")?;

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
        created_at: created_at.and_utc(),
        updated_at: to_utc(row.try_get("updated_at")?),
        started_at: to_utc(row.try_get("started_at")?),
        completed_at: to_utc(row.try_get("completed_at")?),
        task_processing_time: row.try_get("task_processing_time")?,
        retry_count: row.try_get("retry_count")?,
        max_retry_count: row.try_get("max_retry_count")?,
        last_retry_at: to_utc(row.try_get("last_retry_at")?),
        callback_url: row.try_get("callback_url")?,
        callback_status_code: row.try_get("callback_status_code")?,
        callback_message: row.try_get("callback_message")?,
        callback_time: to_utc(row.try_get("callback_time")?),
        platform: row.try_get("platform")?,
        engine_name: row.try_get("engine_name")?,
    })
}

fn push_patch(qb: &mut QueryBuilder<'_, MySql>, patch: &TaskPatch) -> Result<(), StoreError> {
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
        qb.push(", last_retry_at = ").push_bind(val.naive_utc());
    }
    if let Some(val) = patch.started_at {
        qb.push(", started_at = ").push_bind(val.naive_utc());
    }
    if let Some(val) = patch.completed_at {
        qb.push(", completed_at = ").push_bind(val.naive_utc());
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
        qb.push(", callback_time = ").push_bind(val.naive_utc());
    }
    Ok(())
}

#[async_trait]
impl TaskStore for MySqlTaskStore {
    fn backend_name(&self) -> &'static str {
        "mysql"
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
        .bind(now_naive())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_id() as i64)
    }

    async fn get(&self, id: i64) -> Result<Option<DocumentTask>, StoreError> {
        let sql = format!("SELECT {} FROM document_tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(row_to_task).transpose()
    }

    async fn update(&self, id: i64, patch: TaskPatch) -> Result<bool, StoreError> {
        let mut qb: QueryBuilder<'_, MySql> =
            QueryBuilder::new("UPDATE document_tasks SET updated_at = ");
        qb.push_bind(now_naive());
        push_patch(&mut qb, &patch)?;
        qb.push(" WHERE id = ").push_bind(id);

        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(affected > 0)
    }

    async fn claim_pending(&self, id: i64) -> Result<bool, StoreError> {
        let now = now_naive();
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
        let mut qb: QueryBuilder<'_, MySql> = QueryBuilder::new(format!(
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
            qb.push(" AND created_at >= ").push_bind(after.naive_utc());
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before.naive_utc());
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

        let cutoff = (Utc::now() - Duration::days(days as i64)).naive_utc();
        let mut qb: QueryBuilder<'_, MySql> =
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
        info!("MySQL task store closed");
    }
}
