//! HTTP API handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bankroll::{LedgerPersistence, Reservation, ReservationId, Settlement};
use crate::error::LedgerError;
use crate::feed::{ApiKeyPool, KeyUsageView};
use crate::scheduler::{SchedulerStatus, StatusView};
use crate::trading::{BetStats, HistoryStats, OpenBet, OpenBets, SettledBet};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Scheduler status and readiness.
    pub status: SchedulerStatus,
    /// Ledger with its store.
    pub persistence: LedgerPersistence,
    /// Accepted legs awaiting results.
    pub open_bets: OpenBets,
    /// Prometheus renderer, when the exporter is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Odds API key budgets, when live feeds run.
    pub api_keys: Option<Arc<ApiKeyPool>>,
}

impl AppState {
    /// Create new app state.
    pub fn new(status: SchedulerStatus, persistence: LedgerPersistence, open_bets: OpenBets) -> Self {
        Self {
            status,
            persistence,
            open_bets,
            metrics: None,
            api_keys: None,
        }
    }

    /// Attach the Prometheus renderer.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Attach the odds API key pool for usage reporting.
    pub fn with_api_keys(mut self, keys: Arc<ApiKeyPool>) -> Self {
        self.api_keys = Some(keys);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.status.set_ready(ready);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether a cycle has completed.
    pub ready: bool,
    /// Completed cycles.
    pub cycles: u64,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Scheduler state and last cycle.
    pub scheduler: StatusView,
    /// Ledger figures.
    pub bankroll: BankrollResponse,
    /// Settled bet performance.
    pub performance: BetStats,
    /// Odds API usage per key, when live feeds run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_usage: Option<Vec<KeyUsageView>>,
}

/// Ledger figures in status response.
#[derive(Debug, Serialize)]
pub struct BankrollResponse {
    /// Total capital.
    pub total_capital: Decimal,
    /// Reserved capital.
    pub reserved: Decimal,
    /// Available capital.
    pub available: Decimal,
    /// Realized P&L.
    pub realized_pnl: Decimal,
    /// Open reservations.
    pub open_reservations: usize,
}

/// Open bets response.
#[derive(Debug, Serialize)]
pub struct BetsResponse {
    /// Accepted legs awaiting results.
    pub open_bets: Vec<OpenBet>,
    /// Every open ledger reservation, including ones restored from disk.
    pub reservations: Vec<Reservation>,
}

/// History query parameters.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Most recent legs to return.
    pub limit: Option<usize>,
}

/// Settled bet history response.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// Aggregate statistics.
    pub stats: HistoryStats,
    /// Most recent settled legs, newest first.
    pub recent: Vec<SettledBet>,
}

/// Settle a single reservation.
#[derive(Debug, Deserialize)]
pub struct SettleRequest {
    /// Reservation to close.
    pub reservation_id: u64,
    /// Realized P&L.
    pub pnl: Decimal,
}

/// Settle every open bet on a market.
#[derive(Debug, Deserialize)]
pub struct SettleMarketRequest {
    /// Market id.
    pub market_id: String,
    /// Outcome that won.
    pub winning_outcome: String,
}

/// One settled reservation.
#[derive(Debug, Serialize)]
pub struct SettledResponse {
    /// Reservation id.
    pub reservation_id: ReservationId,
    /// Stake that was held.
    pub stake: Decimal,
    /// P&L applied.
    pub pnl: Decimal,
}

impl SettledResponse {
    fn new(reservation_id: ReservationId, settlement: Settlement) -> Self {
        Self {
            reservation_id,
            stake: settlement.stake,
            pnl: settlement.pnl,
        }
    }
}

/// Ledger error mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::UnknownReservation(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidAmount(_) | LedgerError::InvalidSettlement { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LedgerError::InsufficientFunds { .. } => StatusCode::CONFLICT,
            LedgerError::Corruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 after the first cycle, 503 before.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse {
        ready: is_ready,
        cycles: state.status.cycles(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - returns scheduler and bankroll state.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.status.view();
    let snapshot = state.persistence.ledger().snapshot();

    let status = if scheduler.halted_reason.is_some() {
        "halted"
    } else if state.is_ready() {
        "running"
    } else {
        "starting"
    };

    Json(StatusResponse {
        status,
        scheduler,
        bankroll: BankrollResponse {
            total_capital: snapshot.total_capital,
            reserved: snapshot.reserved,
            available: snapshot.available(),
            realized_pnl: snapshot.realized_pnl,
            open_reservations: snapshot.reservations.len(),
        },
        performance: state.open_bets.history().stats().overall,
        api_usage: state.api_keys.as_ref().map(|keys| keys.usage()),
    })
}

/// Settled bet history with ROI statistics.
pub async fn history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> impl IntoResponse {
    let history = state.open_bets.history();
    Json(HistoryResponse {
        stats: history.stats(),
        recent: history.recent(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
    })
}

/// Open bets handler.
pub async fn bets(State(state): State<AppState>) -> impl IntoResponse {
    Json(BetsResponse {
        open_bets: state.open_bets.list(),
        reservations: state.persistence.ledger().snapshot().reservations,
    })
}

/// Settle one reservation with an explicit P&L.
pub async fn settle(
    State(state): State<AppState>,
    Json(request): Json<SettleRequest>,
) -> Result<Json<SettledResponse>, ApiError> {
    let id = ReservationId(request.reservation_id);
    let settlement = state
        .open_bets
        .settle(state.persistence.ledger(), id, request.pnl)?;
    info!(id = %id, pnl = %request.pnl, "Settled via API");
    persist(&state).await;
    Ok(Json(SettledResponse::new(id, settlement)))
}

/// Settle a whole market given its winning outcome.
pub async fn settle_market(
    State(state): State<AppState>,
    Json(request): Json<SettleMarketRequest>,
) -> Result<Json<Vec<SettledResponse>>, ApiError> {
    let settled = state.open_bets.settle_market(
        state.persistence.ledger(),
        &request.market_id,
        &request.winning_outcome,
    )?;
    if !settled.is_empty() {
        persist(&state).await;
    }
    Ok(Json(
        settled
            .into_iter()
            .map(|(id, s)| SettledResponse::new(id, s))
            .collect(),
    ))
}

/// Prometheus scrape handler.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed".to_string()),
    }
}

async fn persist(state: &AppState) {
    if let Err(e) = state.persistence.persist().await {
        warn!(error = %e, "Failed to persist ledger after settlement");
    }
}
