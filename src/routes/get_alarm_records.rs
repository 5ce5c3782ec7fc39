use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{error_response, AppState};
use crate::AlarmRecord;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/api/alarm-records", get(handler))
}

/// Query parameters for the alarm log.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecordsQuery {
    gateway_id: String,
    page: Option<u32>,
    /// Page size; defaults to `ALARM_PAGE_SIZE`.
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlarmRecordsResponse {
    data: Vec<AlarmRecord>,
    total: u64,
    page: u32,
    total_pages: u32,
}

async fn handler(
    Query(params): Query<AlarmRecordsQuery>,
    State((service, config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    let page = params.page.unwrap_or(1);
    let limit = params.limit.unwrap_or(config.page_size);
    info!(
        "GET /api/alarm-records - gateway={} page={} limit={}",
        params.gateway_id, page, limit
    );

    match service.alarm_page(&params.gateway_id, page, limit).await {
        Ok(result) => {
            let body = AlarmRecordsResponse {
                data: result.records,
                total: result.total_count,
                page: result.page,
                total_pages: result.total_pages,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("GET /api/alarm-records - {}", e);
            error_response(&e)
        }
    }
}
