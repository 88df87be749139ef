//! API v0 endpoints.
//!
//! Version 0 signals an unstable API -- breaking changes are expected.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::api_client::types::StatsSnapshot;
use crate::stats::Stats;

/// Shared application state available to all handlers.
pub(crate) type AppState = Arc<Stats>;

/// Build the v0 API routes.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
}

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}

/// Return the current counters.
async fn get_stats(State(stats): State<AppState>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}
