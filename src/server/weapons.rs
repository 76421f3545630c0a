use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use super::{current_session, mutating_session, AppState};
use crate::error::AppResult;
use crate::inventory::{self, AssignRequest, NewWeapon, ReturnRequest, WeaponPatch, WeaponView};
use crate::model::Weapon;

pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<WeaponView>>> {
    current_session(&state, &headers)?;
    Ok(Json(state.store.read(inventory::list_weapons)))
}

pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<WeaponView>> {
    current_session(&state, &headers)?;
    Ok(Json(state.store.read(|t| inventory::get_weapon(t, &id))?))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<NewWeapon>,
) -> AppResult<impl IntoResponse> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::create_weapon(&state.store, &session.principal, input)?;
    state.publish(&m.events).await;
    Ok((StatusCode::CREATED, Json(m.value)))
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<WeaponPatch>,
) -> AppResult<Json<Weapon>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::update_weapon(&state.store, &session.principal, &id, patch)?;
    state.publish(&m.events).await;
    Ok(Json(m.value))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::delete_weapon(&state.store, &session.principal, &id)?;
    state.publish(&m.events).await;
    Ok(Json(serde_json::json!({ "success": true, "id": m.value.id })))
}

/// `POST /api/weapons/assign {weaponId, userId?}`.
pub async fn assign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AssignRequest>,
) -> AppResult<Json<Weapon>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::assign_weapon(&state.store, &session.principal, req)?;
    state.publish(&m.events).await;
    Ok(Json(m.value))
}

/// `POST /api/weapons/return {weaponId, ammunition?}`.
pub async fn return_weapon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReturnRequest>,
) -> AppResult<Json<Weapon>> {
    let session = mutating_session(&state, &headers)?;
    let m = inventory::return_weapon(&state.store, &session.principal, req)?;
    state.publish(&m.events).await;
    Ok(Json(m.value))
}
