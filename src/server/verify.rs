use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{clear_session_cookie, mutating_session, AppState};
use crate::error::{AppError, AppResult};
use crate::identity::{verify_member_role, RoleVerdict};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `POST /api/verify-discord-role`.
pub async fn verify_discord_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = req
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::user("missing_user_id", "userId is required"))?;
    let caller = mutating_session(&state, &headers)?;
    if !caller.principal.may_act_for(&user_id) {
        return Err(AppError::auth("unauthorized", "Unauthorized"));
    }

    let requirement = state.config.discord.requirement();
    let outcome = verify_member_role(
        &state.store,
        state.discord.as_ref(),
        requirement.as_ref(),
        &user_id,
        state.config.deprovision_on_denied,
    )
    .await?;
    state.publish(&outcome.events).await;

    let status = StatusCode::from_u16(outcome.verdict.http_status()).unwrap_or(StatusCode::OK);
    let mut out_headers = HeaderMap::new();
    let revoked = matches!(outcome.verdict, RoleVerdict::Expired { .. } | RoleVerdict::Denied { .. });
    if revoked && caller.principal.user_id == user_id {
        out_headers.insert("Set-Cookie", clear_session_cookie());
    }
    Ok((status, out_headers, Json(outcome.verdict.result())))
}
