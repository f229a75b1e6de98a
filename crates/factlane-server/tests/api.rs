//! Control API tests against the real router and a temporary store.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use factlane_agents::{AgentError, ChatRequest, ChatResponse, ChatTransport};
use factlane_queue::{EndpointRegistry, QueueSettings, StageGauges};
use factlane_server::{build_router, ApiState};
use factlane_store::{EndpointBinding, SqliteQueueStore, ANALYSIS_STAGES};

/// Transport that answers probes with a fixed model list.
struct StaticTransport;

#[async_trait]
impl ChatTransport for StaticTransport {
    async fn chat(
        &self,
        _binding: &EndpointBinding,
        _request: &ChatRequest,
    ) -> Result<ChatResponse, AgentError> {
        Err(AgentError::Protocol("not used in api tests".into()))
    }

    async fn list_models(&self, _binding: &EndpointBinding) -> Result<Vec<String>, AgentError> {
        Ok(vec!["model-a".into(), "model-b".into()])
    }
}

async fn test_state() -> ApiState {
    let path = std::env::temp_dir().join(format!("factlane-api-{}.db", uuid::Uuid::new_v4()));
    let store = SqliteQueueStore::open(path.to_str().expect("utf8 path")).expect("open store");
    let registry = EndpointRegistry::load(store.clone()).await.expect("registry");
    ApiState {
        store: store.clone(),
        registry,
        settings: QueueSettings::new(store),
        gauges: StageGauges::for_stages(&ANALYSIS_STAGES),
        transport: Arc::new(StaticTransport),
        worker_stages: ANALYSIS_STAGES.to_vec(),
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

fn ingest_body(source_id: &str) -> Value {
    json!({
        "source_id": source_id,
        "title": "T",
        "author": "u/poster",
        "body": "B",
        "created_utc": Utc::now().to_rfc3339(),
        "metadata": { "priority": 7 }
    })
}

#[tokio::test]
async fn ingest_is_idempotent_on_source_id() {
    let app = build_router(test_state().await);

    let first = app
        .clone()
        .oneshot(post_json("/v1/items", ingest_body("abc")))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    let first = body_json(first).await;
    assert_eq!(first["data"]["duplicate"], false);
    assert!(first["data"]["item_id"].is_i64());

    let second = app
        .oneshot(post_json("/v1/items", ingest_body("abc")))
        .await
        .expect("response");
    let second = body_json(second).await;
    assert_eq!(second["data"]["duplicate"], true);
    assert!(second["data"]["item_id"].is_null());
}

#[tokio::test]
async fn pause_is_idempotent_and_visible_in_status() {
    let app = build_router(test_state().await);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/v1/queue/research/pause", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let status = body_json(
        app.clone()
            .oneshot(get("/v1/queue/status"))
            .await
            .expect("response"),
    )
    .await;
    let research = status["data"]["stages"]
        .as_array()
        .expect("stages")
        .iter()
        .find(|s| s["stage"] == "research")
        .expect("research entry")
        .clone();
    assert_eq!(research["paused"], true);
    assert_eq!(research["current_load"], 0);
    assert!(research["max_concurrent"].as_u64().expect("cap") >= 1);

    let resumed = app
        .oneshot(post_json("/v1/queue/research/resume", json!({})))
        .await
        .expect("response");
    assert_eq!(resumed.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_setting_key_is_rejected() {
    let app = build_router(test_state().await);

    let bad = app
        .clone()
        .oneshot(put_json("/v1/settings/dead_letter_threshold", json!({"value": "3"})))
        .await
        .expect("response");
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    let body = body_json(bad).await;
    assert_eq!(body["error"]["code"], "invalid_argument");

    let good = app
        .oneshot(put_json("/v1/settings/max_retry_attempts", json!({"value": "5"})))
        .await
        .expect("response");
    assert_eq!(good.status(), StatusCode::OK);
}

#[tokio::test]
async fn bad_setting_value_reports_structured_details() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(put_json("/v1/settings/max_retry_attempts", json!({"value": "lots"})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_argument");
    assert_eq!(body["error"]["details"]["key"], "max_retry_attempts");
    assert_eq!(body["error"]["details"]["value"], "lots");
}

#[tokio::test]
async fn endpoint_rebind_validates_provider_and_persists() {
    let app = build_router(test_state().await);

    let bad = app
        .clone()
        .oneshot(put_json(
            "/v1/endpoints/research",
            json!({
                "provider": "mainframe",
                "base_url": "http://example.com",
                "model": "m",
                "max_concurrent": 2,
                "timeout_seconds": 60
            }),
        ))
        .await
        .expect("response");
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let good = app
        .clone()
        .oneshot(put_json(
            "/v1/endpoints/research",
            json!({
                "provider": "hosted",
                "base_url": "https://api.example.com/",
                "model": "researcher-large",
                "max_concurrent": 3,
                "timeout_seconds": 300,
                "auth_env_key": "RESEARCH_API_KEY"
            }),
        ))
        .await
        .expect("response");
    assert_eq!(good.status(), StatusCode::OK);

    let listed = body_json(
        app.oneshot(get("/v1/endpoints")).await.expect("response"),
    )
    .await;
    let research = listed["data"]["endpoints"]
        .as_array()
        .expect("endpoints")
        .iter()
        .find(|e| e["stage"] == "research")
        .expect("research binding")
        .clone();
    assert_eq!(research["model"], "researcher-large");
    assert_eq!(research["provider"], "hosted");
    // Trailing slash is normalized away.
    assert_eq!(research["base_url"], "https://api.example.com");
}

#[tokio::test]
async fn probe_returns_models_from_the_transport() {
    let app = build_router(test_state().await);

    let response = app
        .oneshot(post_json("/v1/endpoints/triage/probe", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["available"], true);
    assert_eq!(body["data"]["models"], json!(["model-a", "model-b"]));
}

#[tokio::test]
async fn history_of_unknown_item_is_not_found() {
    let app = build_router(test_state().await);
    let response = app
        .oneshot(get("/v1/items/9999/history"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_post_queue_views_answer() {
    let app = build_router(test_state().await);

    app.clone()
        .oneshot(post_json("/v1/items", ingest_body("xyz")))
        .await
        .expect("ingest");

    let stats = body_json(
        app.clone()
            .oneshot(get("/v1/queue/stats"))
            .await
            .expect("response"),
    )
    .await;
    let rows = stats["data"]["stats"].as_array().expect("rows");
    assert!(rows
        .iter()
        .any(|r| r["stage"] == "triage" && r["status"] == "pending" && r["count"] == 1));

    let post_queue = body_json(
        app.oneshot(get("/v1/post-queue")).await.expect("response"),
    )
    .await;
    assert_eq!(post_queue["data"]["items"], json!([]));
}

#[tokio::test]
async fn unknown_stage_in_path_is_rejected() {
    let app = build_router(test_state().await);
    let response = app
        .oneshot(post_json("/v1/queue/shipping/pause", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
