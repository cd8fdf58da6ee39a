use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use vdispatch::api::{self, state::AppState};
use vdispatch::queue::TaskQueue;
use vdispatch::storage::{self, ResultStore, SqliteStore};
use vdispatch::task::{HistoryRecord, Task, TaskParam, TaskResult, TaskStatus};

fn create_test_app() -> (Router, Arc<TaskQueue>, Arc<dyn ResultStore>) {
    let queue = Arc::new(TaskQueue::new());
    let store: Arc<dyn ResultStore> =
        Arc::new(SqliteStore::new(storage::open_memory_pool().unwrap()));
    let app = api::router(AppState::new(queue.clone(), store.clone()));
    (app, queue, store)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn request_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn delete(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn task(id: &str) -> Task {
    Task::new(id, vec![TaskParam::new("amf", "70")])
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _queue, _store) = create_test_app();

    let (status, body) = get_json(&app, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["queue_depth"], 0);
}

#[tokio::test]
async fn test_submit_assigns_sequential_ids_and_queues() {
    let (app, queue, _store) = create_test_app();
    let payload = json!({ "params": [{ "component": "amf", "version": "70" }] });

    let (status, body) = request_json(&app, "POST", "/api/v1/tasks", payload.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["task_id"], "1");
    assert_eq!(body["data"]["status"], "queueing");

    let (_, body) = request_json(&app, "POST", "/api/v1/tasks", payload).await;
    assert_eq!(body["data"]["task_id"], "2");

    assert_eq!(queue.len(), 2);
    let (status, body) = get_json(&app, "/api/v1/queue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["data"][0]["id"], "1");
    assert_eq!(body["data"][0]["params"][0]["component"], "amf");
}

#[tokio::test]
async fn test_submit_rejects_invalid_params() {
    let (app, queue, _store) = create_test_app();

    let (status, body) =
        request_json(&app, "POST", "/api/v1/tasks", json!({ "params": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("params"));

    let (status, _) = request_json(
        &app,
        "POST",
        "/api/v1/tasks",
        json!({ "params": [{ "component": "amf", "version": " " }] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_remove_from_queue() {
    let (app, queue, _store) = create_test_app();
    queue.push(task("5")).unwrap();

    let (status, body) = delete(&app, "/api/v1/queue/5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "deleted");
    assert!(queue.is_empty());

    let (status, body) = delete(&app, "/api/v1/queue/5").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_task_status_views() {
    let (app, queue, store) = create_test_app();

    let (status, _) = get_json(&app, "/api/v1/tasks/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // queued
    queue.push(task("9")).unwrap();
    let (status, body) = get_json(&app, "/api/v1/tasks/9").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "queueing");

    // running
    let t = queue.remove("9").unwrap();
    store.save_result(&TaskResult::running(&t, Utc::now())).unwrap();
    let (_, body) = get_json(&app, "/api/v1/tasks/9").await;
    assert_eq!(body["data"]["status"], "running");
    assert_eq!(body["meta"]["total"], 1);

    // finished with two failed sub-tests
    store
        .save_result(&TaskResult::failed_test(&t, "TestA".into(), "TestA\nFAIL: TestA".into(), Utc::now()))
        .unwrap();
    store
        .save_result(&TaskResult::failed_test(&t, "TestB".into(), "TestB\nFAIL: TestB".into(), Utc::now()))
        .unwrap();
    let (_, body) = get_json(&app, "/api/v1/tasks/9").await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["data"]["results"][1]["failed_tests"][0], "TestB");
}

#[tokio::test]
async fn test_popped_task_is_queueing_until_marked_running() {
    let (app, queue, store) = create_test_app();
    queue.push(task("14")).unwrap();

    let t = queue.pop(&CancellationToken::new()).await.unwrap();
    let (status, body) = get_json(&app, "/api/v1/tasks/14").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "queueing");

    store.save_result(&TaskResult::running(&t, Utc::now())).unwrap();
    queue.release(&t.id);
    let (status, body) = get_json(&app, "/api/v1/tasks/14").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");
}

#[tokio::test]
async fn test_download_logs() {
    let (app, _queue, store) = create_test_app();
    let t = task("12");

    let req = Request::builder()
        .uri("/api/v1/tasks/12/logs")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    store
        .save_result(&TaskResult::failed_test(&t, "TestA".into(), "TestA\nFAIL: TestA".into(), Utc::now()))
        .unwrap();

    let req = Request::builder()
        .uri("/api/v1/tasks/12/logs")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(text, "==== TestA (failed) ====\nTestA\nFAIL: TestA\n");
}

#[tokio::test]
async fn test_running_endpoint() {
    let (app, _queue, store) = create_test_app();
    store.save_result(&TaskResult::running(&task("3"), Utc::now())).unwrap();

    let (status, body) = get_json(&app, "/api/v1/running").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["task_id"], "3");
    assert_eq!(body["data"][0]["status"], "running");
}

#[tokio::test]
async fn test_history_paging_bounds() {
    let (app, _queue, store) = create_test_app();
    for id in ["1", "2", "3"] {
        store
            .save_history(&HistoryRecord::for_task(&task(id), TaskStatus::Success, Utc::now()))
            .unwrap();
    }

    let (status, body) = get_json(&app, "/api/v1/history/0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_records"], 3);
    assert_eq!(body["data"]["total_pages"], 1);
    assert_eq!(body["data"]["records"][0]["task_name"], "Test Task 1");

    // one past the last page is still answered, with no records
    let (status, body) = get_json(&app, "/api/v1/history/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["records"].as_array().unwrap().len(), 0);

    let (status, _) = get_json(&app, "/api/v1/history/2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pr_cache_endpoints() {
    let (app, _queue, store) = create_test_app();

    let (status, body) = get_json(&app, "/api/v1/prs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    store
        .save_pr_cache(br#"[{"number": 42, "title": "bump amf"}]"#)
        .unwrap();
    let (_, body) = get_json(&app, "/api/v1/prs").await;
    assert_eq!(body["data"][0]["number"], 42);

    let (status, _) = delete(&app, "/api/v1/prs/cache").await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get_json(&app, "/api/v1/prs").await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _queue, _store) = create_test_app();

    let req = Request::builder()
        .uri("/api/v1/nope")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, b"not found");
}
