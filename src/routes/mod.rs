use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde_json::json;

use crate::{AlarmError, AlarmService, Config};

mod alarm_feed;
mod alarm_feed_ws;
mod get_alarm_records;
mod health;
mod post_readings;
mod post_reload;

// ---

/// Shared state for every route: the alarm service and the loaded config.
pub type AppState = (Arc<AlarmService>, Config);

pub fn router(service: Arc<AlarmService>, config: Config) -> Router {
    // ---
    Router::new()
        .merge(post_readings::router())
        .merge(get_alarm_records::router())
        .merge(post_reload::router())
        .merge(alarm_feed::router())
        .merge(alarm_feed_ws::router())
        .merge(health::router())
        .with_state((service, config))
}

// ---

/// Map an engine error onto an HTTP status with a `{"error": ...}` body.
fn error_response(err: &AlarmError) -> Response {
    // ---
    let status = match err {
        AlarmError::MalformedReading(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AlarmError::InvalidPage { .. } => StatusCode::BAD_REQUEST,
        AlarmError::ConfigLoad { .. } => StatusCode::BAD_GATEWAY,
        AlarmError::SourceClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        AlarmError::UnknownSubscription(_) => StatusCode::NOT_FOUND,
        AlarmError::StoreAppend(_) | AlarmError::StoreQuery(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
