mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use runway_engine::{api::create_router, auth::StaticKeyAuthenticator, state::AppState};
use runway_id::EnvId;
use serde_json::{json, Value};
use tower::ServiceExt;

const OWNER_KEY: &str = "rw_dev_owner";
const OTHER_KEY: &str = "rw_prod_other";

struct TestApp {
    router: Router,
}

impl TestApp {
    fn new() -> Self {
        let authenticator = StaticKeyAuthenticator::new()
            .with_key(OWNER_KEY, EnvId::new())
            .with_key(OTHER_KEY, EnvId::new());
        let state = AppState::new(
            common::engine(),
            Arc::new(authenticator),
            common::MASTER_QUEUE,
            None,
        );
        Self {
            router: create_router(state),
        }
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        api_key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Option<String>, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, content_type, value)
    }
}

#[tokio::test]
async fn health_needs_no_key() {
    let app = TestApp::new();
    let (status, _, body) = app.send(Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, body) = app.send(Method::GET, "/readyz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"]["engine"]["status"], "ok");
}

#[tokio::test]
async fn missing_or_unknown_key_is_unauthorized() {
    let app = TestApp::new();

    let (status, content_type, body) = app
        .send(Method::POST, "/api/v1/waitpoints/tokens", None, Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(content_type.as_deref(), Some("application/problem+json"));
    assert_eq!(body["code"], "missing_authorization");

    let (status, _, body) = app
        .send(
            Method::POST,
            "/api/v1/waitpoints/tokens",
            Some("rw_dev_nope"),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_api_key");
}

#[tokio::test]
async fn token_create_is_idempotent_by_key() {
    let app = TestApp::new();
    let body = json!({ "idempotency_key": "deploy-approval" });

    let (status, _, first) = app
        .send(
            Method::POST,
            "/api/v1/waitpoints/tokens",
            Some(OWNER_KEY),
            Some(body.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["is_cached"], false);
    assert!(first["id"].as_str().unwrap().starts_with("waitpoint_"));

    let (status, _, second) = app
        .send(
            Method::POST,
            "/api/v1/waitpoints/tokens",
            Some(OWNER_KEY),
            Some(body),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["is_cached"], true);
    assert_eq!(second["id"], first["id"]);
}

#[tokio::test]
async fn token_completion_is_scoped_to_the_environment() {
    let app = TestApp::new();
    let (_, _, created) = app
        .send(
            Method::POST,
            "/api/v1/waitpoints/tokens",
            Some(OWNER_KEY),
            Some(json!({})),
        )
        .await;
    let uri = format!(
        "/api/v1/waitpoints/tokens/{}/complete",
        created["id"].as_str().unwrap()
    );

    let (status, content_type, problem) = app
        .send(
            Method::POST,
            &uri,
            Some(OTHER_KEY),
            Some(json!({ "data": { "approved": true } })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(content_type.as_deref(), Some("application/problem+json"));
    assert_eq!(problem["code"], "waitpoint_not_found");

    for _ in 0..2 {
        let (status, _, body) = app
            .send(
                Method::POST,
                &uri,
                Some(OWNER_KEY),
                Some(json!({ "data": { "approved": true } })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
    }
}

#[tokio::test]
async fn malformed_token_id_is_not_found() {
    let app = TestApp::new();
    let (status, _, problem) = app
        .send(
            Method::POST,
            "/api/v1/waitpoints/tokens/not-a-token/complete",
            Some(OWNER_KEY),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], "waitpoint_not_found");
}

#[tokio::test]
async fn triggered_run_lands_in_the_callers_queue() {
    let app = TestApp::new();

    let (status, _, run) = app
        .send(
            Method::POST,
            "/api/v1/tasks/reports%2Fgenerate/trigger",
            Some(OWNER_KEY),
            Some(json!({ "payload": { "report": 7 }, "options": { "machine": "micro" } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "PENDING");
    let run_id = run["id"].as_str().unwrap().to_string();

    let (_, _, owner_len) = app
        .send(Method::GET, "/api/v1/queues/length", Some(OWNER_KEY), None)
        .await;
    assert_eq!(owner_len["length"], 1);
    let (_, _, other_len) = app
        .send(Method::GET, "/api/v1/queues/length", Some(OTHER_KEY), None)
        .await;
    assert_eq!(other_len["length"], 0);

    let (status, _, _) = app
        .send(
            Method::GET,
            &format!("/api/v1/runs/{run_id}"),
            Some(OTHER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, cancelled) = app
        .send(
            Method::POST,
            &format!("/api/v1/runs/{run_id}/cancel"),
            Some(OWNER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "FAILED");
}

#[tokio::test]
async fn unknown_machine_is_a_bad_request() {
    let app = TestApp::new();
    let (status, _, problem) = app
        .send(
            Method::POST,
            "/api/v1/tasks/email/trigger",
            Some(OWNER_KEY),
            Some(json!({ "options": { "machine": "huge-64x" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "unknown_machine_preset");
}
