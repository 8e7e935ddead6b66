// doc2md-scheduler - The asynchronous task pipeline
//
// A single-process scheduler runs six cooperative coordinators (fetcher,
// priority merger, updater, cleaner, callback, GC) plus a bounded pool of K
// conversion workers, all communicating through the bounded queue fabric.
// The store is the single source of truth: queues carry ids only, and every
// worker re-reads its task row before acting.
//
// Crash recovery: before any worker spawns, every `processing` row is reset
// to `pending` with the recovery marker, so a mid-conversion crash never
// loses a task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use doc2md_config::{CallbackConfig, SchedulerConfig};
use doc2md_engine::ConversionDispatcher;
use doc2md_storage::ObjectStoreGateway;
use doc2md_store::{StoreError, TaskStore};

pub mod queues;
mod workers;
pub mod workspace;

pub use queues::{QueueDepths, QueueFabric};
pub use workspace::{WorkspaceManager, WorkspaceStats};

/// Error message stamped on rows reset by crash recovery.
pub const RECOVERY_MARKER: &str = "recovered after restart";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(String),
}

/// Everything the worker loops share.
pub(crate) struct SchedulerCore {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) workspace: Arc<WorkspaceManager>,
    pub(crate) gateway: Arc<ObjectStoreGateway>,
    pub(crate) dispatcher: Arc<ConversionDispatcher>,
    pub(crate) queues: QueueFabric,
    pub(crate) config: SchedulerConfig,
    pub(crate) callback: CallbackConfig,
    pub(crate) http: reqwest::Client,
    pub(crate) shutdown: CancellationToken,
}

/// Runtime counters for the statistics and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub max_concurrent_tasks: usize,
    pub queue_depths: QueueDepths,
    pub workspace: WorkspaceStats,
}

pub struct TaskScheduler {
    core: Arc<SchedulerCore>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        workspace: Arc<WorkspaceManager>,
        gateway: Arc<ObjectStoreGateway>,
        dispatcher: Arc<ConversionDispatcher>,
        config: SchedulerConfig,
        callback: CallbackConfig,
    ) -> Result<Self, SchedulerError> {
        let http = reqwest::Client::builder()
            .timeout(callback.timeout())
            .build()
            .map_err(|e| SchedulerError::Http(e.to_string()))?;

        let queues = QueueFabric::new(config.queue_capacity);

        Ok(Self {
            core: Arc::new(SchedulerCore {
                store,
                workspace,
                gateway,
                dispatcher,
                queues,
                config,
                callback,
                http,
                shutdown: CancellationToken::new(),
            }),
            handles: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Recover interrupted tasks, then spawn the coordinators and the
    /// conversion worker pool.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return Ok(());
        }

        let recovered = workers::recover_incomplete_tasks(&self.core).await?;
        if recovered > 0 {
            info!("Recovered {} interrupted tasks to pending", recovered);
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(workers::fetcher_loop(self.core.clone())));
        handles.push(tokio::spawn(workers::merger_loop(self.core.clone())));
        handles.push(tokio::spawn(workers::updater_loop(self.core.clone())));
        handles.push(tokio::spawn(workers::cleaner_loop(self.core.clone())));
        handles.push(tokio::spawn(workers::callback_loop(self.core.clone())));
        handles.push(tokio::spawn(workers::gc_loop(self.core.clone())));

        for worker_id in 0..self.core.config.max_concurrent_tasks {
            handles.push(tokio::spawn(workers::conversion_worker_loop(
                self.core.clone(),
                worker_id,
            )));
        }

        info!(
            "Scheduler started with {} conversion workers (poll every {}s)",
            self.core.config.max_concurrent_tasks, self.core.config.task_check_interval_secs
        );
        Ok(())
    }

    /// Graceful shutdown: coordinators drain their current item, workers
    /// finish their current conversion, then everything joins.
    pub async fn shutdown(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        info!("Stopping scheduler...");
        self.core.shutdown.cancel();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// Wake the fetcher for a freshly created or retried task. The id itself
    /// travels through the store; a full intake queue is harmless because
    /// the next poll picks the row up anyway.
    pub fn enqueue(&self, task_id: i64) {
        if self.core.queues.intake.try_send(task_id).is_err() {
            tracing::debug!("Intake queue full; task {} waits for the next poll", task_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.core.shutdown.is_cancelled()
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.core.queues.depths()
    }

    pub fn workspace(&self) -> &Arc<WorkspaceManager> {
        &self.core.workspace
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            is_running: self.is_running(),
            max_concurrent_tasks: self.core.config.max_concurrent_tasks,
            queue_depths: self.queue_depths(),
            workspace: self.core.workspace.stats().await,
        }
    }
}
