use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;

use super::{Pool, ResultStore, StoreError, HISTORY_PAGE_SIZE};
use crate::task::{HistoryPage, HistoryRecord, TaskResult, TaskStatus};

const TASK_ID_COUNTER: &str = "task_id";

/// [`ResultStore`] backed by an r2d2 SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Decode JSON rows, skipping (and logging) any that no longer parse.
fn decode_rows<T: DeserializeOwned>(rows: Vec<String>, table: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|json| match serde_json::from_str(&json) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(table, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}

fn to_sql_int(v: u64) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::Corrupt(format!("value {} exceeds sqlite range", v)))
}

impl ResultStore for SqliteStore {
    fn save_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        let json = serde_json::to_string(result)?;
        let created_at = result.timestamp.to_rfc3339();
        let mut conn = self.pool.get()?;

        if result.status == TaskStatus::Running {
            conn.execute(
                "INSERT INTO running_tasks (task_id, result_json, started_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(task_id) DO UPDATE SET
                    result_json = excluded.result_json,
                    started_at = excluded.started_at",
                params![result.task_id, json, created_at],
            )?;
            tracing::debug!(task_id = %result.task_id, "Running marker saved");
            return Ok(());
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO task_results (task_id, status, result_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![result.task_id, result.status.as_str(), json, created_at],
        )?;
        if result.status.is_terminal() {
            tx.execute(
                "DELETE FROM running_tasks WHERE task_id = ?1",
                params![result.task_id],
            )?;
        }
        tx.commit()?;

        tracing::debug!(task_id = %result.task_id, status = %result.status, "Result saved");
        Ok(())
    }

    fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        let conn = self.pool.get()?;

        let running: Option<String> = conn
            .query_row(
                "SELECT result_json FROM running_tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;

        let json = match running {
            Some(json) => Some(json),
            None => conn
                .query_row(
                    "SELECT result_json FROM task_results WHERE task_id = ?1
                     ORDER BY id DESC LIMIT 1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?,
        };

        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn get_results(&self, task_id: &str) -> Result<Vec<TaskResult>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT result_json FROM task_results WHERE task_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decode_rows(rows, "task_results"))
    }

    fn delete_result(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let deleted = if status == TaskStatus::Running {
            conn.execute(
                "DELETE FROM running_tasks WHERE task_id = ?1",
                params![task_id],
            )?
        } else {
            conn.execute(
                "DELETE FROM task_results WHERE task_id = ?1 AND status = ?2",
                params![task_id, status.as_str()],
            )?
        };
        tracing::debug!(task_id, %status, deleted, "Deleted task result rows");
        Ok(())
    }

    fn get_running_tasks(&self) -> Result<Vec<TaskResult>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT result_json FROM running_tasks ORDER BY started_at")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decode_rows(rows, "running_tasks"))
    }

    fn increment_task_id(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let next: i64 = conn.query_row(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            params![TASK_ID_COUNTER],
            |row| row.get(0),
        )?;
        u64::try_from(next).map_err(|_| StoreError::Corrupt(format!("negative task id counter {}", next)))
    }

    fn save_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO task_history (record_json, created_at) VALUES (?1, ?2)",
            params![json, record.time.to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_history(&self, page: u64) -> Result<HistoryPage, StoreError> {
        let total_records = self.history_count()?;
        let total_pages = total_records.div_ceil(HISTORY_PAGE_SIZE);

        let records = match page.checked_mul(HISTORY_PAGE_SIZE) {
            Some(offset) if offset < total_records => {
                let conn = self.pool.get()?;
                let mut stmt = conn.prepare(
                    "SELECT record_json FROM task_history ORDER BY id LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(
                        params![to_sql_int(HISTORY_PAGE_SIZE)?, to_sql_int(offset)?],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                decode_rows(rows, "task_history")
            }
            _ => Vec::new(),
        };

        Ok(HistoryPage {
            records,
            page,
            total_pages,
            total_records,
        })
    }

    fn history_count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM task_history", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative row count {}", count)))
    }

    fn save_pr_cache(&self, payload: &[u8]) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO pr_cache (id, payload, updated_at) VALUES (1, ?1, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![payload],
        )?;
        Ok(())
    }

    fn get_pr_cache(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.pool.get()?;
        let payload = conn
            .query_row("SELECT payload FROM pr_cache WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(payload)
    }

    fn clear_pr_cache(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM pr_cache", [])?;
        Ok(())
    }
}
