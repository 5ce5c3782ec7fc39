use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::post, Json,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{error_response, AppState};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/alarm-settings/reload", post(handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadQuery {
    gateway_id: String,
}

/// Re-fetch a gateway's thresholds after they were changed upstream, or
/// after an earlier load failed. Buffered readings are replayed on success.
async fn handler(
    Query(params): Query<ReloadQuery>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    info!("POST /api/alarm-settings/reload - gateway={}", params.gateway_id);

    match service.reload(&params.gateway_id).await {
        Ok(rules) => (
            StatusCode::OK,
            Json(json!({ "gatewayId": params.gateway_id, "rules": rules })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}
