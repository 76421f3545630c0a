use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{clear_session_cookie, current_session, mutating_session, parse_cookie, set_session_cookie, AppState, SESSION_COOKIE};
use crate::error::{AppError, AppResult};
use crate::identity::{DiscordAuthProvider, LoginRequest};
use crate::model::{Millis, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    pub user: User,
    pub csrf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub user: User,
    pub expires_at: Millis,
}

/// `POST /api/auth/sign-in {accessToken, expiresIn?}`.
pub async fn sign_in(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<impl IntoResponse> {
    let provider = DiscordAuthProvider::new(state.store.clone(), state.sessions.clone(), state.discord.clone());
    let login = provider.login(&req).await?;
    state.publish(&login.events).await;
    let mut headers = HeaderMap::new();
    headers.insert("Set-Cookie", set_session_cookie(&login.session.token, state.sessions.ttl)?);
    Ok((StatusCode::OK, headers, Json(SignInResponse { user: login.user, csrf: login.session.csrf })))
}

pub async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    mutating_session(&state, &headers)?;
    if let Some(token) = parse_cookie(&headers, SESSION_COOKIE) {
        state.sessions.logout(&token)?;
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    Ok((StatusCode::OK, h, Json(serde_json::json!({"status": "ok"}))))
}

pub async fn session(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<SessionInfo>> {
    let session = current_session(&state, &headers)?;
    let user = state
        .store
        .read(|t| t.users.get(&session.principal.user_id).cloned())
        .ok_or_else(|| AppError::auth("unauthorized", "Unauthorized"))?;
    Ok(Json(SessionInfo { user, expires_at: session.expires_at }))
}

pub async fn csrf(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<serde_json::Value>> {
    let session = current_session(&state, &headers)?;
    Ok(Json(serde_json::json!({ "csrf": session.csrf })))
}
