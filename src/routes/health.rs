// src/routes/health.rs
//! Health check endpoint for the alarm service.
//!
//! Used by container orchestrators and CI to verify that the service is up.
//! It is a sibling module in the `routes` directory and follows the Explicit
//! Module Boundary Pattern (EMBP): the handler stays private, the gateway
//! (`mod.rs`) only sees the subrouter.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Gateways whose thresholds are currently loaded.
    gateways_loaded: usize,
    /// Open alarm feed subscriptions.
    feed_subscribers: usize,
}

/// Handle `GET /health`.
///
/// Does not touch the database or the settings API; both counts come from
/// in-memory state.
async fn health(State((service, _)): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        gateways_loaded: service.loaded_gateways(),
        feed_subscribers: service.feed_subscribers().await,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
