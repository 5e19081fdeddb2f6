//! # Tests for Handlers
//!
//! Router-level tests against an in-memory SQLite database.

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::engine::Engine;
use crate::models::{project, source};
use crate::queue::InMemoryDeliveryQueue;
use crate::rate_limiter::InMemoryCounterStore;
use crate::server::{AppState, create_app};

async fn test_state() -> AppState {
    let db: DatabaseConnection = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    let db = Arc::new(db);

    let engine = Engine::builder(db.clone())
        .queue(Arc::new(InMemoryDeliveryQueue::new()))
        .counter_store(Arc::new(InMemoryCounterStore::new()))
        .build()
        .unwrap();

    AppState { engine, db }
}

async fn insert_source(state: &AppState, rate_limit_count: i32, verifier: Value) -> source::Model {
    let now = Utc::now().fixed_offset();
    let project = state
        .engine
        .repos
        .projects
        .create(project::Model {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            rate_limit_count,
            rate_limit_duration: "1m".to_string(),
            disable_endpoint: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    state
        .engine
        .repos
        .sources
        .create(source::Model {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: "billing".to_string(),
            verifier,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
}

fn ingest_request(source_id: Uuid, body: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/ingest/{source_id}"))
        .header("content-type", "application/json")
        .header("X-Courier-Event-Type", "invoice.paid");
    if let Some(key) = api_key {
        builder = builder.header("X-Api-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn readyz_checks_database() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ready");
}

#[tokio::test]
async fn stats_reports_empty_queue() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["scheduled"], 0);
    assert_eq!(body["ready"], 0);
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn ingest_unknown_source_is_not_found() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(ingest_request(Uuid::new_v4(), r#"{"id":1}"#, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn request_id_is_echoed_and_reported_in_errors() {
    let app = create_app(test_state().await);

    let mut request = ingest_request(Uuid::new_v4(), r#"{"id":1}"#, None);
    request
        .headers_mut()
        .insert("x-request-id", "req-7f3a".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-7f3a");
    assert_eq!(json_body(response).await["trace_id"], "req-7f3a");

    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let minted = response.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert!(Uuid::parse_str(minted).is_ok());
}

#[tokio::test]
async fn ingest_requires_source_credentials() {
    let state = test_state().await;
    let source = insert_source(
        &state,
        0,
        json!({ "type": "api_key", "header": "X-Api-Key", "key": "k-123" }),
    )
    .await;
    let app = create_app(state);

    let missing = app
        .clone()
        .oneshot(ingest_request(source.id, r#"{"id":1}"#, None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(ingest_request(source.id, r#"{"id":1}"#, Some("nope")))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let accepted = app
        .oneshot(ingest_request(source.id, r#"{"id":1}"#, Some("k-123")))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let body = json_body(accepted).await;
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["deliveries"], 0);
}

#[tokio::test]
async fn stored_event_omits_the_source_credential_header() {
    let state = test_state().await;
    let source = insert_source(
        &state,
        0,
        json!({ "type": "api_key", "header": "X-Api-Key", "key": "k-123" }),
    )
    .await;
    let app = create_app(state.clone());

    let request = Request::builder()
        .method("POST")
        .uri(format!("/ingest/{}", source.id))
        .header("content-type", "application/json")
        .header("X-Courier-Event-Type", "invoice.paid")
        .header("X-Api-Key", "k-123")
        .header("X-Region", "eu")
        .body(Body::from(r#"{"id":1}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let event_id: Uuid = json_body(response).await["event_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let event = state
        .engine
        .repos
        .events
        .find_by_id(event_id)
        .await
        .unwrap()
        .unwrap();
    let headers = event.headers.unwrap();
    assert_eq!(headers["x-region"], "eu");
    assert!(headers.get("x-api-key").is_none());
}

#[tokio::test]
async fn ingest_rejects_non_json_payload() {
    let state = test_state().await;
    let source = insert_source(&state, 0, json!({ "type": "noop" })).await;
    let app = create_app(state);

    let response = app
        .oneshot(ingest_request(source.id, "not json", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn ingest_enforces_project_rate_limit() {
    let state = test_state().await;
    let source = insert_source(&state, 1, json!({ "type": "noop" })).await;
    let app = create_app(state);

    let first = app
        .clone()
        .oneshot(ingest_request(source.id, r#"{"n":1}"#, None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app
        .oneshot(ingest_request(source.id, r#"{"n":2}"#, None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
}
