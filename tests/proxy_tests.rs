//! Proxy surface tests
//!
//! Drives the axum router directly with fake collaborators behind the
//! supervisor: identity enforcement, policy checks, rate limiting and the
//! no-internal-leakage guarantee of the error boundary.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use botfleet::config::LimitsConfig;
use botfleet::proxy::{
    create_router, AppState, RateLimiter, StaticTokenVerifier, UpstreamClient,
};
use botfleet::supervisor::Supervisor;
use botfleet::types::TenantId;

use common::{build_supervisor, test_fleet, FakeLauncher, RecordingProvisioner};

const TOKEN: &str = "tok-tenant-a";
const TENANT: &str = "tenant-a";

fn test_state(supervisor: Supervisor) -> AppState {
    let mut verifier = StaticTokenVerifier::new();
    verifier.insert(TOKEN, TenantId::from(TENANT));

    AppState {
        supervisor,
        verifier: Arc::new(verifier),
        limiter: Arc::new(RateLimiter::new(&LimitsConfig {
            control_per_window: 3,
            trade_per_window: 10,
            window_secs: 60,
        })),
        upstream: Arc::new(UpstreamClient::new(std::time::Duration::from_secs(1))),
    }
}

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    authed(Request::builder().method("POST").uri(uri))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/bot/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/bot/status")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn start_then_status_reports_running() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/v1/bot/start"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["started"], json!(true));

    let response = app
        .oneshot(
            authed(Request::builder().uri("/api/v1/bot/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["running"], json!(true));
    assert_eq!(body["data"]["state"], json!("running"));
}

#[tokio::test]
async fn status_for_fresh_tenant_is_absent() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .oneshot(
            authed(Request::builder().uri("/api/v1/bot/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["running"], json!(false));
    assert_eq!(body["data"]["state"], json!("absent"));
}

#[tokio::test]
async fn forcebuy_rejects_pair_outside_whitelist() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor.clone()));

    let response = app
        .clone()
        .oneshot(json_post(
            "/api/v1/bot/start",
            json!({ "pair_whitelist": ["BTC/USDT"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_post(
            "/api/v1/bot/forcebuy",
            json!({ "pair": "DOGE/USDT" }),
        ))
        .await
        .unwrap();

    // Rejected at the boundary: a 400 here (not 502) proves the request
    // never went upstream, since no bot process is listening.
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("pair not whitelisted"));

    // The instance is untouched.
    let tenant = TenantId::from(TENANT);
    assert_eq!(
        supervisor.status(&tenant).await.state.to_string(),
        "running"
    );
}

#[tokio::test]
async fn forcebuy_without_instance_conflicts() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .oneshot(json_post(
            "/api/v1/bot/forcebuy",
            json!({ "pair": "BTC/USDT" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn balance_without_instance_conflicts() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    let response = app
        .oneshot(
            authed(Request::builder().uri("/api/v1/bot/balance"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn control_calls_are_rate_limited_with_retry_hint() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor));

    // Budget of 3 control calls per window.
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/v1/bot/start"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/v1/bot/start"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn error_responses_never_leak_port_or_credential() {
    let supervisor = build_supervisor(
        test_fleet(),
        FakeLauncher::new(),
        RecordingProvisioner::new(),
    );
    let app = create_router(test_state(supervisor.clone()));

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/api/v1/bot/start"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tenant = TenantId::from(TENANT);
    let endpoint = supervisor.endpoint(&tenant).await.unwrap();

    // Nothing listens on the fake instance's port, so the whitelisted
    // forcebuy fails upstream; the response must stay generic.
    let response = app
        .oneshot(json_post(
            "/api/v1/bot/forcebuy",
            json!({ "pair": "BTC/USDT" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(
        !text.contains(&endpoint.port.to_string()),
        "response leaked the internal port: {text}"
    );
    assert!(
        !text.contains(&endpoint.credential.password),
        "response leaked the internal credential: {text}"
    );
    assert!(!text.contains("127.0.0.1"), "response leaked the address");
}
