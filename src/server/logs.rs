use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;

use super::{current_session, AppState};
use crate::error::AppResult;
use crate::inventory::{list_logs, LogFilter, LogView};

/// `GET /api/logs?weaponId=&userId=&limit=`, newest first.
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<LogFilter>,
) -> AppResult<Json<Vec<LogView>>> {
    current_session(&state, &headers)?;
    Ok(Json(state.store.read(|t| list_logs(t, &filter))))
}
