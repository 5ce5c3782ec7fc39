use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{error_response, AppState};

// ---

/// Pull surface of the alarm feed: open a subscription, read its merged
/// page-1 view (or a stored later page), re-sync it, and close it.
pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/alarm-feed", post(open))
        .route("/api/alarm-feed/{id}", get(page).delete(close))
        .route("/api/alarm-feed/{id}/refresh", post(refresh))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenQuery {
    gateway_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    page: Option<u32>,
}

async fn open(
    Query(params): Query<OpenQuery>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    info!("POST /api/alarm-feed - gateway={}", params.gateway_id);

    match service.open_feed(&params.gateway_id).await {
        Ok((subscription, view)) => (
            StatusCode::CREATED,
            Json(json!({ "subscriptionId": subscription.handle.id(), "view": view })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn page(
    Path(id): Path<Uuid>,
    Query(params): Query<PageQuery>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    let page = params.page.unwrap_or(1);
    match service.feed_page(id, page).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn refresh(
    Path(id): Path<Uuid>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    match service.refresh_feed(id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn close(
    Path(id): Path<Uuid>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    info!("DELETE /api/alarm-feed/{}", id);

    match service.close_feed(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
