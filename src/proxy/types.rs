//! Proxy API Types
//!
//! DTOs for the client-facing surface. Only fields listed here are ever
//! serialized outward; internal addressing (port, credential, pid) has no
//! representation in this module by design of the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::InstanceState;

// ─────────────────────────────────────────────────────────────────
// Response envelope
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Request bodies
// ─────────────────────────────────────────────────────────────────

/// POST /start - every field optional; defaults come from provisioning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub initial_balance: Option<f64>,
    pub pair_whitelist: Option<Vec<String>>,
    pub strategy: Option<String>,
}

/// POST /forcebuy
#[derive(Debug, Clone, Deserialize)]
pub struct ForcebuyRequest {
    pub pair: String,
    pub amount: Option<f64>,
}

/// POST /forcesell - accepts either spelling the frontends use.
#[derive(Debug, Clone, Deserialize)]
pub struct ForcesellRequest {
    pub tradeid: Option<String>,
    pub trade_id: Option<String>,
}

impl ForcesellRequest {
    pub fn trade_id(&self) -> Option<&str> {
        self.tradeid.as_deref().or(self.trade_id.as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────
// Response bodies
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub state: InstanceState,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub started: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Sanitized subset of the bot's balance payload.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceResponse {
    pub total: Value,
    pub available: Value,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewResponse {
    pub available_balance: f64,
    pub equity: f64,
    pub total_equity: f64,
    pub unrealized_pnl: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradesResponse {
    pub trades: Value,
}

/// One open trade on the bot, reshaped to the frontend position model.
#[derive(Debug, Clone, Serialize)]
pub struct PositionResponse {
    pub position_id: String,
    pub user_id: String,
    pub instrument_id: Option<String>,
    pub instrument_symbol: Option<String>,
    pub side: String,
    pub status: String,
    pub quantity: f64,
    pub average_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: Option<f64>,
    pub opened_at: Option<String>,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsResponse {
    pub positions: Vec<PositionResponse>,
}
