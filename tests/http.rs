//! HTTP API tests driving the axum router in-process.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use stepwise::chat::{ChatRouter, MockProvider};
use stepwise::config::Config;
use stepwise::embedding::HashingEmbedder;
use stepwise::engine::Engine;
use stepwise::server::{router, AppState};

fn app_with(config: Config) -> Router {
    let mut chat = ChatRouter::new();
    chat.register(Arc::new(MockProvider));
    let engine = Engine::new(config, chat, Arc::new(HashingEmbedder::new(64)));
    router(AppState {
        engine: Arc::new(engine),
    })
}

fn app() -> Router {
    app_with(Config::minimal())
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn start_body(root: &std::path::Path, goal: &str) -> Value {
    json!({
        "workspaceRoot": root.to_string_lossy(),
        "goalPrompt": goal,
        "provider": "mock"
    })
}

#[tokio::test]
async fn test_health() {
    let (status, body) = call(&app(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_job_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let app = app();

    let (status, job) = call(
        &app,
        Method::POST,
        "/autopilot/start",
        Some(start_body(tmp.path(), "Add a README")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "awaiting-approval");
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["waitingStepId"], job["steps"][0]["id"]);

    let (status, list) = call(&app, Method::GET, "/autopilot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["goalPreview"], "Add a README");

    let (status, job) = call(&app, Method::GET, &format!("/autopilot/{}/status", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["steps"][0]["status"], "staged");

    let (status, outcome) =
        call(&app, Method::POST, &format!("/autopilot/{}/approve", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["state"], "done");
    assert_eq!(outcome["appliedFiles"], "all");
    assert_eq!(outcome["currentStep"], 1);
    assert!(outcome.get("waitingStepId").is_none());

    let (status, err) = call(&app, Method::POST, &format!("/autopilot/{}/abort", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "conflict");
}

#[tokio::test]
async fn test_selective_approve_body() {
    let tmp = TempDir::new().unwrap();
    let app = app();
    let (_, job) = call(
        &app,
        Method::POST,
        "/autopilot/start",
        Some(start_body(tmp.path(), "Add a README")),
    )
    .await;
    let id = job["id"].as_str().unwrap();

    let (status, outcome) = call(
        &app,
        Method::POST,
        &format!("/autopilot/{}/approve", id),
        Some(json!({"selectedFiles": ["README.md"], "approveAll": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["appliedFiles"], json!(["README.md"]));
}

#[tokio::test]
async fn test_start_validation_errors() {
    let tmp = TempDir::new().unwrap();
    let app = app();

    let (status, err) = call(
        &app,
        Method::POST,
        "/autopilot/start",
        Some(start_body(tmp.path(), "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["code"], "bad_request");

    let (status, _) = call(
        &app,
        Method::POST,
        "/autopilot/start",
        Some(start_body(&tmp.path().join("missing"), "Add a README")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = app();
    let (status, err) = call(&app, Method::GET, "/autopilot/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"]["code"], "not_found");

    let (status, _) = call(&app, Method::DELETE, "/autopilot/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_forget_and_recover() {
    let tmp = TempDir::new().unwrap();
    let app = app();
    let (_, job) = call(
        &app,
        Method::POST,
        "/autopilot/start",
        Some(start_body(tmp.path(), "Add a README")),
    )
    .await;
    let id = job["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::DELETE, &format!("/autopilot/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["forgotten"], id.as_str());

    let (status, _) = call(&app, Method::GET, &format!("/autopilot/{}/status", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, job) = call(
        &app,
        Method::POST,
        &format!("/autopilot/{}/recover", id),
        Some(json!({"workspaceRoot": tmp.path().to_string_lossy()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "awaiting-approval");
}

#[tokio::test]
async fn test_index_status_and_search() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("src")).unwrap();
    fs::write(
        tmp.path().join("src/parser.rs"),
        "pub fn parse_header(input: &str) -> Header {\n    Header::from(input)\n}\n",
    )
    .unwrap();
    fs::write(tmp.path().join("notes.md"), "# Deployment\n\nShip on Fridays.\n").unwrap();
    let app = app();
    let root = tmp.path().to_string_lossy().to_string();

    let (status, before) = call(&app, Method::GET, &format!("/context/status?root={}", root), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["ready"], false);

    let (status, built) = call(
        &app,
        Method::POST,
        "/context/index",
        Some(json!({"workspaceRoot": root})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(built["ready"], true);
    assert_eq!(built["items"], 2);
    assert_eq!(built["model"], "hashing-64");

    let (status, found) = call(
        &app,
        Method::GET,
        &format!("/context/search?root={}&q=parse%20header&k=1", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let matches = found["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["filePath"], "src/parser.rs");
    assert!(found["packed"].as_str().unwrap().contains("[src/parser.rs:1-3]"));

    let (status, _) = call(
        &app,
        Method::GET,
        &format!("/context/search?root={}&q=%20", root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_search_with_embeddings_disabled() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.embedding.provider = "disabled".into();
    let app = app_with(config);

    let (status, err) = call(
        &app,
        Method::GET,
        &format!("/context/search?root={}&q=x", tmp.path().to_string_lossy()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["code"], "embeddings_disabled");
}
