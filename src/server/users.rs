use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use super::{current_session, mutating_session, AppState};
use crate::error::AppResult;
use crate::inventory::{self, require_admin, UserPatch, UserView};
use crate::model::User;

/// Admin only; each user comes with the weapons they hold.
pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<UserView>>> {
    let session = current_session(&state, &headers)?;
    require_admin(&session.principal)?;
    Ok(Json(state.store.read(inventory::list_users)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<UserPatch>,
) -> AppResult<Json<User>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::update_user(&state.store, &session.principal, &id, patch)?;
    state.publish(&m.events).await;
    Ok(Json(m.value))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::delete_user(&state.store, &session.principal, &id)?;
    state.publish(&m.events).await;
    Ok(Json(serde_json::json!({ "success": true, "id": m.value.id })))
}
