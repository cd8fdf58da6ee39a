//! SQLite storage layer -- schema, result store, history log, task-ID counter.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

use crate::task::{HistoryPage, HistoryRecord, TaskResult, TaskStatus};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Number of history records per page.
pub const HISTORY_PAGE_SIZE: u64 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode stored record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence contract for task lifecycle data.
///
/// Implementations must keep at most one running marker per task and drop it
/// when a terminal result for the same task is saved.
pub trait ResultStore: Send + Sync {
    /// Save a running marker (upsert) or append a terminal result.
    fn save_result(&self, result: &TaskResult) -> Result<(), StoreError>;

    /// The running marker if present, else the latest terminal result.
    fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError>;

    /// Every terminal result for a task, oldest first.
    fn get_results(&self, task_id: &str) -> Result<Vec<TaskResult>, StoreError>;

    /// Delete the running marker (`Running`) or the terminal results with `status`.
    fn delete_result(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError>;

    fn get_running_tasks(&self) -> Result<Vec<TaskResult>, StoreError>;

    /// Atomically bump and return the shared task-ID counter (first value is 1).
    fn increment_task_id(&self) -> Result<u64, StoreError>;

    fn save_history(&self, record: &HistoryRecord) -> Result<(), StoreError>;

    /// Zero-based page of the history log in insertion order.
    fn get_history(&self, page: u64) -> Result<HistoryPage, StoreError>;

    fn history_count(&self) -> Result<u64, StoreError>;

    fn save_pr_cache(&self, payload: &[u8]) -> Result<(), StoreError>;

    fn get_pr_cache(&self) -> Result<Option<Vec<u8>>, StoreError>;

    fn clear_pr_cache(&self) -> Result<(), StoreError>;
}

fn with_pragmas(manager: SqliteConnectionManager) -> SqliteConnectionManager {
    manager.with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    })
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = R2D2Pool::new(with_pragmas(SqliteConnectionManager::file(path)))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory pool. Every `memory()` connection is its own
/// database, so the pool must never hand out a second one.
pub fn open_memory_pool() -> Result<Pool, StoreError> {
    let pool = R2D2Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(SqliteConnectionManager::memory())?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
