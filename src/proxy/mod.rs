//! Authenticated Proxy
//!
//! Client-facing HTTP surface. Each request carries a bearer token that
//! the identity verifier resolves to a tenant id; the proxy then enforces
//! per-tenant policy (rate limits, pair whitelist), resolves the tenant's
//! live instance, translates identity into the instance's Basic-Auth
//! credential and forwards over loopback.
//!
//! Every outbound response is rebuilt from parsed JSON through the DTOs in
//! [`types`]; this is the allow-list boundary that keeps ports, credentials
//! and pids from ever being serialized to a client.

mod api;
mod auth;
mod rate_limit;
mod types;
mod upstream;

pub use api::create_router;
pub use auth::{IdentityVerifier, StaticTokenVerifier};
pub use rate_limit::{RateLimiter, RouteClass};
pub use types::*;
pub use upstream::UpstreamClient;

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::SupervisorError;
use crate::supervisor::Supervisor;

/// Shared state for the proxy router.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
}

/// Client-visible failures. Conversion to a response is the single place
/// where control-plane errors become wire bytes.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    RateLimited { retry_after_secs: u64 },
    PairNotWhitelisted,
    BadRequest(&'static str),
    Supervisor(SupervisorError),
    /// Error status relayed from the tenant's own bot API.
    Upstream { status: u16, detail: Value },
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError::Supervisor(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => error_response(
                StatusCode::UNAUTHORIZED,
                "invalid or expired token".to_string(),
            ),
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate limit exceeded".to_string(),
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, retry_after_secs.into());
                response
            }
            ApiError::PairNotWhitelisted => {
                error_response(StatusCode::BAD_REQUEST, "pair not whitelisted".to_string())
            }
            ApiError::BadRequest(msg) => error_response(StatusCode::BAD_REQUEST, msg.to_string()),
            ApiError::Supervisor(err) => {
                let status = match err {
                    SupervisorError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
                    SupervisorError::StartupTimeout => StatusCode::GATEWAY_TIMEOUT,
                    SupervisorError::FailedToStart(_) => StatusCode::BAD_GATEWAY,
                    SupervisorError::PermanentlyFailed => StatusCode::SERVICE_UNAVAILABLE,
                    SupervisorError::InstanceNotRunning => StatusCode::CONFLICT,
                    SupervisorError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
                };
                // Display strings are the allow-listed fixed phrases from
                // the taxonomy; source chains stay in the logs.
                error_response(status, err.to_string())
            }
            ApiError::Upstream { status, detail } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = detail
                    .get("detail")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| detail.to_string());
                error_response(status, message)
            }
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ApiResponse::<Value>::error(message))).into_response()
}

/// Start the proxy server
pub async fn start_server(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = create_router(state);

    tracing::info!("🚪 Proxy front door starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
