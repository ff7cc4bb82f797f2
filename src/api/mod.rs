//! HTTP API module for health, metrics, status and settlement endpoints.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
