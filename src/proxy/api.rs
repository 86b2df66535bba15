//! Proxy HTTP API
//!
//! REST endpoints for tenant bot control and passthrough. Route shapes
//! mirror the bot's own API one-to-one; the handlers add identity
//! resolution, policy enforcement and response reshaping.

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use reqwest::Method;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use super::types::*;
use super::{ApiError, AppState, RouteClass};
use crate::types::{InstanceState, ProvisioningParams, TenantId};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Lifecycle
        .route("/api/v1/bot/status", get(get_status))
        .route("/api/v1/bot/start", post(start_instance))
        .route("/api/v1/bot/stop", post(stop_instance))
        // Passthrough with reshaping
        .route("/api/v1/bot/balance", get(get_balance))
        .route("/api/v1/bot/overview", get(get_overview))
        .route("/api/v1/bot/trades", get(get_trades))
        .route("/api/v1/bot/positions", get(get_positions))
        // Trade actions
        .route("/api/v1/bot/forcebuy", post(forcebuy))
        .route("/api/v1/bot/forcesell", post(forcesell))
        // State
        .with_state(state)
        // CORS for frontend
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ─────────────────────────────────────────────────────────────────
// Identity extraction
// ─────────────────────────────────────────────────────────────────

/// Verified tenant identity for the current request.
pub struct Identity(pub TenantId);

#[axum::async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        match state.verifier.verify(token).await {
            Some(tenant) => Ok(Identity(tenant)),
            None => Err(ApiError::Unauthorized),
        }
    }
}

fn check_rate(state: &AppState, tenant: &TenantId, class: RouteClass) -> Result<(), ApiError> {
    state
        .limiter
        .check(tenant, class)
        .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })
}

/// Upstream error statuses propagate to the client; the body is reshaped
/// by the error boundary, never relayed raw.
fn relay(status: u16, data: Value) -> Result<Value, ApiError> {
    if status >= 400 {
        Err(ApiError::Upstream {
            status,
            detail: data,
        })
    } else {
        Ok(data)
    }
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle handlers
// ─────────────────────────────────────────────────────────────────

/// GET /api/v1/bot/status - Instance state without touching the process
async fn get_status(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let status = state.supervisor.status(&tenant).await;
    Json(ApiResponse::success(StatusResponse {
        running: status.state == InstanceState::Running,
        state: status.state,
        started_at: status.started_at,
        restart_count: status.restart_count,
    }))
}

/// POST /api/v1/bot/start - Explicit start (idempotent)
async fn start_instance(
    Identity(tenant): Identity,
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate(&state, &tenant, RouteClass::Control)?;

    let request = body.map(|Json(body)| body).unwrap_or_default();
    let defaults = ProvisioningParams::default();
    let params = ProvisioningParams {
        initial_balance: request
            .initial_balance
            .filter(|balance| *balance > 0.0)
            .unwrap_or(defaults.initial_balance),
        pair_whitelist: request
            .pair_whitelist
            .filter(|pairs| !pairs.is_empty())
            .unwrap_or(defaults.pair_whitelist),
        strategy: request.strategy,
    };

    state.supervisor.ensure_running(&tenant, params).await?;
    Ok(Json(ApiResponse::success(StartResponse { started: true })))
}

/// POST /api/v1/bot/stop - Graceful stop (no-op when absent)
async fn stop_instance(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate(&state, &tenant, RouteClass::Control)?;

    let stopped = state.supervisor.stop(&tenant).await;
    Ok(Json(ApiResponse::success(StopResponse { stopped })))
}

// ─────────────────────────────────────────────────────────────────
// Passthrough handlers
// ─────────────────────────────────────────────────────────────────

/// GET /api/v1/bot/balance - Sanitized balance
async fn get_balance(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, data) = state
        .upstream
        .request(&state.supervisor, &tenant, Method::GET, "/balance", None)
        .await?;
    let data = relay(status, data)?;

    Ok(Json(ApiResponse::success(BalanceResponse {
        total: data.get("total").cloned().unwrap_or_else(|| json!({})),
        available: data.get("available").cloned().unwrap_or_else(|| json!({})),
        currency: data
            .get("currency")
            .and_then(Value::as_str)
            .map(str::to_string),
    })))
}

/// GET /api/v1/bot/overview - Balance + open-trade PnL fan-in
async fn get_overview(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, balance) = state
        .upstream
        .request(&state.supervisor, &tenant, Method::GET, "/balance", None)
        .await?;
    let balance = relay(status, balance)?;

    let (status, open_trades) = state
        .upstream
        .request(&state.supervisor, &tenant, Method::GET, "/status", None)
        .await?;
    let open_trades = relay(status, open_trades)?;

    let unrealized_pnl: f64 = open_trades
        .as_array()
        .map(|trades| {
            trades
                .iter()
                .filter_map(|trade| trade.get("profit_abs").and_then(Value::as_f64))
                .sum()
        })
        .unwrap_or(0.0);

    let currency = balance
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or("USDT")
        .to_string();
    let available_balance = first_number(balance.get("available"));
    let mut total_equity = first_number(balance.get("total"));
    if total_equity == 0.0 {
        total_equity = available_balance + unrealized_pnl;
    }

    Ok(Json(ApiResponse::success(OverviewResponse {
        available_balance,
        equity: total_equity,
        total_equity,
        unrealized_pnl,
        currency,
    })))
}

/// GET /api/v1/bot/trades - Trade history passthrough
async fn get_trades(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, data) = state
        .upstream
        .request(&state.supervisor, &tenant, Method::GET, "/trades", None)
        .await?;
    let data = relay(status, data)?;

    Ok(Json(ApiResponse::success(TradesResponse { trades: data })))
}

/// GET /api/v1/bot/positions - Open trades reshaped to positions
async fn get_positions(
    Identity(tenant): Identity,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let (status, data) = state
        .upstream
        .request(&state.supervisor, &tenant, Method::GET, "/status", None)
        .await?;
    let data = relay(status, data)?;

    let positions = data
        .as_array()
        .map(|trades| {
            trades
                .iter()
                .map(|trade| map_position(&tenant, trade))
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(ApiResponse::success(PositionsResponse { positions })))
}

fn map_position(tenant: &TenantId, trade: &Value) -> PositionResponse {
    let pair = trade.get("pair").and_then(Value::as_str).map(str::to_string);
    PositionResponse {
        position_id: trade
            .get("trade_id")
            .map(json_id_to_string)
            .unwrap_or_default(),
        user_id: tenant.to_string(),
        instrument_id: pair.clone(),
        instrument_symbol: pair,
        side: "long".to_string(),
        status: "open".to_string(),
        quantity: number_or_zero(trade.get("amount")),
        average_entry_price: number_or_zero(trade.get("open_rate")),
        current_price: number_or_zero(trade.get("current_rate")),
        unrealized_pnl: number_or_zero(trade.get("profit_abs")),
        realized_pnl: None,
        opened_at: trade
            .get("open_date")
            .and_then(Value::as_str)
            .map(str::to_string),
        closed_at: None,
    }
}

// ─────────────────────────────────────────────────────────────────
// Trade-action handlers
// ─────────────────────────────────────────────────────────────────

/// POST /api/v1/bot/forcebuy - Whitelist-checked market entry
async fn forcebuy(
    Identity(tenant): Identity,
    State(state): State<AppState>,
    Json(request): Json<ForcebuyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate(&state, &tenant, RouteClass::Trade)?;

    let pair = request.pair.trim();
    if pair.is_empty() {
        return Err(ApiError::BadRequest("pair is required"));
    }

    // Enforced before any forwarding: a rejected pair never reaches the
    // upstream process.
    match state.supervisor.params(&tenant).await {
        Some(params) if params.pair_allowed(pair) => {}
        Some(_) => return Err(ApiError::PairNotWhitelisted),
        None => return Err(crate::error::SupervisorError::InstanceNotRunning.into()),
    }

    let payload = json!({ "pair": pair, "amount": request.amount });
    let (status, data) = state
        .upstream
        .request(
            &state.supervisor,
            &tenant,
            Method::POST,
            "/forcebuy",
            Some(payload),
        )
        .await?;
    let data = relay(status, data)?;

    Ok(Json(ApiResponse::success(data)))
}

/// POST /api/v1/bot/forcesell - Close an open trade by id
async fn forcesell(
    Identity(tenant): Identity,
    State(state): State<AppState>,
    Json(request): Json<ForcesellRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_rate(&state, &tenant, RouteClass::Trade)?;

    let Some(trade_id) = request.trade_id() else {
        return Err(ApiError::BadRequest("tradeid is required"));
    };

    let payload = json!({ "tradeid": trade_id });
    let (status, data) = state
        .upstream
        .request(
            &state.supervisor,
            &tenant,
            Method::POST,
            "/forcesell",
            Some(payload),
        )
        .await?;
    let data = relay(status, data)?;

    Ok(Json(ApiResponse::success(data)))
}

// ─────────────────────────────────────────────────────────────────
// JSON helpers
// ─────────────────────────────────────────────────────────────────

/// Trade ids arrive as numbers or strings depending on bot version.
fn json_id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_or_zero(value: Option<&Value>) -> f64 {
    value
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

/// First numeric value in a `currency -> amount` map; balances keep their
/// primary currency first.
fn first_number(value: Option<&Value>) -> f64 {
    value
        .and_then(Value::as_object)
        .and_then(|map| {
            map.values().find_map(|v| {
                v.as_f64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_number_reads_currency_maps() {
        let balance = json!({ "USDT": 1234.5, "BTC": 0.1 });
        assert_eq!(first_number(Some(&balance)), 1234.5);
        assert_eq!(first_number(Some(&json!({}))), 0.0);
        assert_eq!(first_number(None), 0.0);
        // String-encoded amounts parse too
        assert_eq!(first_number(Some(&json!({ "USDT": "99.5" }))), 99.5);
    }

    #[test]
    fn position_mapping_handles_partial_trades() {
        let tenant = TenantId::from("tenant-a");
        let trade = json!({
            "trade_id": 7,
            "pair": "BTC/USDT",
            "amount": 0.5,
            "open_rate": 40000.0,
            "current_rate": 41000.0,
            "profit_abs": 500.0,
            "open_date": "2024-01-01 00:00:00",
        });

        let position = map_position(&tenant, &trade);
        assert_eq!(position.position_id, "7");
        assert_eq!(position.instrument_symbol.as_deref(), Some("BTC/USDT"));
        assert_eq!(position.quantity, 0.5);
        assert_eq!(position.unrealized_pnl, 500.0);
        assert_eq!(position.user_id, "tenant-a");

        // Missing fields default rather than fail
        let sparse = map_position(&tenant, &json!({}));
        assert_eq!(sparse.quantity, 0.0);
        assert_eq!(sparse.position_id, "");
    }

    #[test]
    fn relay_passes_success_and_rejects_errors() {
        assert!(relay(200, json!({"ok": true})).is_ok());
        let err = relay(502, json!({"detail": "boom"})).unwrap_err();
        assert!(matches!(err, ApiError::Upstream { status: 502, .. }));
    }
}
