use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod logging;
pub mod metering;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod validation;

use crate::handlers::{chat_handler, code_handler, health_handler, metrics_handler};
use crate::state::AppState;

// Router with every route wired to the shared state
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/code", post(code_handler))
        .with_state(state)
}
