use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};
use serde_json::json;
use tracing::{debug, warn};

use super::{error_response, AppState};
use crate::Reading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/readings", post(handler))
}

/// Accept one gateway reading and queue it for evaluation.
///
/// Returns 202 once the reading is queued; alarms are produced asynchronously
/// by the gateway's worker. A malformed `data` shape is rejected with 422.
async fn handler(
    State((service, _config)): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    // ---
    let reading = match Reading::from_json(body) {
        Ok(reading) => reading,
        Err(e) => {
            warn!("POST /api/readings - {}", e);
            return error_response(&e);
        }
    };

    debug!(
        "POST /api/readings - gateway={} timestamp={}",
        reading.gateway_id, reading.timestamp
    );

    match service.ingest(reading).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response(),
        Err(e) => {
            warn!("POST /api/readings - failed to queue reading: {}", e);
            error_response(&e)
        }
    }
}
