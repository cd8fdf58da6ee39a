//! API route definitions.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::task::{Task, TaskParam, TaskResult, TaskStatus};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/queue", get(list_queue))
        .route("/queue/{task_id}", delete(remove_from_queue))
        .route("/tasks", post(submit_task))
        .route("/tasks/{task_id}", get(task_status))
        .route("/tasks/{task_id}/logs", get(download_logs))
        .route("/running", get(running_tasks))
        .route("/history/{page}", get(history))
        .route("/prs", get(cached_prs))
        .route("/prs/cache", delete(clear_pr_cache))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "queue_depth": state.queue.len()
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_queue(State(state): State<AppState>) -> Json<Value> {
    let tasks = state.queue.tasks();
    Json(json!({ "data": tasks, "meta": { "total": tasks.len() } }))
}

async fn remove_from_queue(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.queue.remove(&task_id)?;
    Ok(Json(json!({ "data": { "task_id": task_id, "status": "deleted" } })))
}

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub params: Vec<TaskParam>,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.params.is_empty() {
        return Err(ApiError::bad_request("params must not be empty"));
    }
    if let Some(bad) = req
        .params
        .iter()
        .find(|p| p.component.trim().is_empty() || p.version.trim().is_empty())
    {
        return Err(ApiError::bad_request(format!(
            "invalid param '{}': component and version are required",
            bad
        )));
    }

    let task_id = state.store.increment_task_id()?.to_string();
    let task = Task::new(task_id.clone(), req.params);
    tracing::info!(task_id = %task_id, params = %task.params_summary(), "Task submitted");
    state.queue.push(task)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "task_id": task_id, "status": TaskStatus::Queueing } })),
    ))
}

/// Overall status of a finished task: failed if any result failed.
fn aggregate_status(results: &[TaskResult]) -> TaskStatus {
    if results.iter().any(|r| r.status == TaskStatus::Failed) {
        TaskStatus::Failed
    } else {
        TaskStatus::Success
    }
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    // queue first: a popped task is released only after its running marker is written
    let (status, results) = if let Some(task) = state.queue.get(&task_id) {
        (
            TaskStatus::Queueing,
            vec![TaskResult::queueing(&task, Utc::now())],
        )
    } else {
        match state.store.get_result(&task_id)? {
            Some(current) if current.status == TaskStatus::Running => {
                (TaskStatus::Running, vec![current])
            }
            Some(_) => {
                let results = state.store.get_results(&task_id)?;
                (aggregate_status(&results), results)
            }
            None => return Err(ApiError::not_found(format!("task {} not found", task_id))),
        }
    };

    Ok(Json(json!({
        "data": { "task_id": task_id, "status": status, "results": results },
        "meta": { "total": results.len() }
    })))
}

async fn download_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state.store.get_results(&task_id)?;
    if results.is_empty() {
        return Err(ApiError::not_found(format!(
            "no results recorded for task {}",
            task_id
        )));
    }

    let mut body = String::new();
    for result in &results {
        if result.failed_tests.is_empty() {
            for log in &result.logs {
                body.push_str(&format!("==== {} ====\n{}\n", result.status, log));
            }
        } else {
            for (name, log) in result.failed_tests.iter().zip(&result.logs) {
                body.push_str(&format!("==== {} ({}) ====\n{}\n", name, result.status, log));
            }
        }
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"task_{}.log\"", task_id),
            ),
        ],
        body,
    ))
}

async fn running_tasks(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let running = state.store.get_running_tasks()?;
    Ok(Json(json!({ "data": running, "meta": { "total": running.len() } })))
}

async fn history(
    State(state): State<AppState>,
    Path(page): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let history = state.store.get_history(page)?;
    if page > history.total_pages {
        return Err(ApiError::bad_request("page number out of range"));
    }
    Ok(Json(json!({ "data": history })))
}

async fn cached_prs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cached = state.store.get_pr_cache()?;
    let prs = cached
        .and_then(|bytes| match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "PR cache holds invalid JSON, ignoring");
                None
            }
        })
        .unwrap_or_else(|| json!([]));
    Ok(Json(json!({ "data": prs })))
}

async fn clear_pr_cache(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.clear_pr_cache()?;
    Ok(Json(json!({ "data": { "status": "cleared" } })))
}
