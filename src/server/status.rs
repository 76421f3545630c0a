use axum::extract::State;
use axum::http::{header, HeaderValue};
use axum::response::IntoResponse;
use axum::Json;
use tracing::error;

use super::AppState;
use crate::error::AppResult;
use crate::status::compute_status;

/// `GET /api/data-status`: latest modification stamp per collection.
pub async fn data_status(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let status = compute_status(state.clock.as_ref()).inspect_err(|e| error!("data status failed: {}", e))?;
    Ok(([(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))], Json(status)))
}
