// doc2md-server - Synchronous HTTP surface over the task pipeline
//
// Thin facade: every handler validates, touches the store or scheduler, and
// returns. The heavy lifting happens in doc2md-scheduler; all dependencies
// are constructed here and passed in explicitly - no process-wide state
// beyond the immutable config.

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use doc2md_config::{DatabaseKind, RuntimeConfig};
use doc2md_engine::ConversionDispatcher;
use doc2md_scheduler::{TaskScheduler, WorkspaceManager};
use doc2md_storage::ObjectStoreGateway;
use doc2md_store::{MySqlTaskStore, SqliteTaskStore, TaskStore};

mod handlers;
mod init;

use handlers::{
    create_task, download_artifact, get_statistics, get_task, health_check, list_tasks,
    retry_failed_tasks, retry_task, update_task_type,
};
use init::init_tracing;

/// Application state shared across all requests
#[derive(Clone)]
pub(crate) struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub gateway: Arc<ObjectStoreGateway>,
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        }
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn bad_request(error: anyhow::Error) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, error)
    }

    pub fn not_found(error: anyhow::Error) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, error)
    }

    pub fn internal(error: anyhow::Error) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Build the API router for an already-wired state. Exposed for tests.
pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks/create", post(create_task))
        .route("/api/tasks/retry-failed", post(retry_failed_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/retry", post(retry_task))
        .route("/api/tasks/:id/task-type", put(update_task_type))
        .route("/api/tasks", get(list_tasks))
        .route("/api/statistics", get(get_statistics))
        .route("/api/health", get(health_check))
        .route("/api/download/:id/:filename", get(download_artifact))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Entry point: wire every component from the config and serve until a
/// shutdown signal arrives.
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    info!("doc2md orchestrator starting");

    // Store backend per config
    let store: Arc<dyn TaskStore> = match config.database.kind {
        DatabaseKind::Sqlite => Arc::new(
            SqliteTaskStore::connect(&config.database.url)
                .await
                .context("Failed to open sqlite task store")?,
        ),
        DatabaseKind::Mysql => Arc::new(
            MySqlTaskStore::connect(&config.database.url)
                .await
                .context("Failed to connect to mysql task store")?,
        ),
    };
    info!("Task store ready ({})", store.backend_name());

    let workspace = Arc::new(
        WorkspaceManager::new(&config.workspace)
            .await
            .context("Failed to prepare workspace directories")?,
    );
    let gateway = Arc::new(ObjectStoreGateway::new(&config.storage));
    let dispatcher = Arc::new(ConversionDispatcher::from_config(&config.engines));

    let scheduler = Arc::new(
        TaskScheduler::new(
            store.clone(),
            workspace,
            gateway.clone(),
            dispatcher,
            config.scheduler.clone(),
            config.callback.clone(),
        )
        .context("Failed to construct scheduler")?,
    );
    scheduler.start().await.context("Failed to start scheduler")?;

    let state = AppState {
        store: store.clone(),
        scheduler: scheduler.clone(),
        gateway,
    };
    let app = router(state);

    let addr = config.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("doc2md API listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/api/tasks/create       - create conversion task", addr);
    info!("  GET  http://{}/api/tasks/{{id}}         - task view", addr);
    info!("  GET  http://{}/api/tasks              - list tasks", addr);
    info!("  POST http://{}/api/tasks/{{id}}/retry   - retry failed task", addr);
    info!("  POST http://{}/api/tasks/retry-failed - bulk retry", addr);
    info!("  PUT  http://{}/api/tasks/{{id}}/task-type - change task type", addr);
    info!("  GET  http://{}/api/statistics         - store + scheduler stats", addr);
    info!("  GET  http://{}/api/health             - liveness + queue depths", addr);
    info!("  GET  http://{}/api/download/{{id}}/{{filename}} - stream artifact", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain workers before the store goes away.
    scheduler.shutdown().await;
    store.close().await;

    info!("Server shutdown complete");
    Ok(())
}
