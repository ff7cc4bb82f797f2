//! HTTP API route definitions.

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{
    bets, health, history, metrics, ready, settle, settle_market, status, AppState,
};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        // Status and bankroll endpoints
        .route("/api/v1/status", get(status))
        .route("/api/v1/bets", get(bets))
        .route("/api/v1/history", get(history))
        .route("/api/v1/settle", post(settle))
        .route("/api/v1/settle-market", post(settle_market))
        .with_state(state)
}
