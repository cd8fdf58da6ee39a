//! vdispatch -- a single-worker dispatcher for validation test runs.
//!
//! Clients submit tasks (component/version parameter lists) over HTTP. Tasks
//! wait in a FIFO queue, and one executor runs the validation script for each,
//! classifies the output into per-subtest results, and records them together
//! with a history entry in SQLite.

pub mod api;
pub mod config;
pub mod executor;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod task;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::executor::{ScriptRunner, TaskExecutor};
use crate::queue::TaskQueue;
use crate::storage::{ResultStore, SqliteStore};

/// Start the daemon: storage, executor loop, and API server.
///
/// Returns once `shutdown` is cancelled and both the server and the executor
/// have stopped.
pub async fn serve(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    // 1. Storage
    let db_path = &config.storage.db_path;
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)
        .with_context(|| format!("failed to open database at {}", db_path))?;
    let store: Arc<dyn ResultStore> = Arc::new(SqliteStore::new(pool));

    // 2. Queue and executor
    let queue = Arc::new(TaskQueue::new());
    let runner = Arc::new(ScriptRunner::from_config(&config.executor));
    let executor = TaskExecutor::from_config(&config.executor, queue.clone(), store.clone(), runner);

    let executor_token = shutdown.clone();
    let executor_handle = tokio::spawn(async move { executor.start(&executor_token).await });

    // 3. API server
    let addr: SocketAddr = config.server.bind.parse()?;
    let app = api::router(api::state::AppState::new(queue, store));

    tracing::info!(%addr, script = %config.executor.script_path.display(), "vdispatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;

    // make sure the executor stops even if the server exited on its own
    shutdown.cancel();
    match executor_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Executor exited with error"),
        Err(e) => tracing::error!(error = %e, "Executor task panicked"),
    }

    served.context("API server failed")?;
    tracing::info!("vdispatch stopped");
    Ok(())
}
