use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use super::{current_session, mutating_session, AppState};
use crate::error::AppResult;
use crate::inventory::{self, NewWeaponType, WeaponTypePatch};
use crate::model::WeaponType;

/// Sorted by name.
pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<WeaponType>>> {
    current_session(&state, &headers)?;
    Ok(Json(state.store.read(inventory::list_weapon_types)))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewWeaponType>,
) -> AppResult<impl IntoResponse> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::create_weapon_type(&state.store, &session.principal, input)?;
    state.publish(&m.events).await;
    Ok((StatusCode::CREATED, Json(m.value)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<WeaponTypePatch>,
) -> AppResult<Json<WeaponType>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::update_weapon_type(&state.store, &session.principal, &id, patch)?;
    state.publish(&m.events).await;
    Ok(Json(m.value))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::delete_weapon_type(&state.store, &session.principal, &id)?;
    state.publish(&m.events).await;
    Ok(Json(serde_json::json!({ "success": true, "id": m.value.id })))
}
