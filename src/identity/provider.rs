use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::session::{IssuedSession, SessionManager};
use crate::discord::{DiscordApi, DiscordUser};
use crate::error::{AppError, AppResult};
use crate::model::{new_id, now_millis, Account, Millis, Role, User, DISCORD_PROVIDER};
use crate::push::{ChangeEvent, ChangeKind};
use crate::storage::{SharedStore, Tables};
use crate::tprintln;

/// Sign-in with a Discord OAuth access token obtained by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub access_token: String,
    /// Token lifetime in seconds, as reported by the OAuth exchange.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub user: User,
    pub session: IssuedSession,
    pub events: Vec<ChangeEvent>,
}

pub struct DiscordAuthProvider {
    store: SharedStore,
    sessions: SessionManager,
    discord: Arc<dyn DiscordApi>,
}

impl DiscordAuthProvider {
    pub fn new(store: SharedStore, sessions: SessionManager, discord: Arc<dyn DiscordApi>) -> Self {
        Self { store, sessions, discord }
    }

    pub async fn login(&self, req: &LoginRequest) -> AppResult<LoginResponse> {
        let token = req.access_token.trim();
        if token.is_empty() {
            return Err(AppError::user("missing_field", "accessToken is required"));
        }
        let Some(profile) = self.discord.current_user(token).await? else {
            return Err(AppError::auth("invalid_token", "Discord rejected the access token"));
        };
        let expires_at = req
            .expires_in
            .map(|secs| now_millis().saturating_add(i64::try_from(secs).unwrap_or(i64::MAX / 2).saturating_mul(1000)));
        let (user, events) = self
            .store
            .transact(|t, now| Ok(upsert_discord_identity(t, &profile, token, expires_at, now)))?;
        let session = self.sessions.issue(&user.id)?;
        info!(user = %user.id, discord = %profile.id, "signed_in");
        tprintln!("auth.login user={} discord={}", user.id, profile.id);
        Ok(LoginResponse { user, session, events })
    }
}

/// Create or refresh the user and Discord account for `profile`.
fn upsert_discord_identity(
    t: &mut Tables,
    profile: &DiscordUser,
    token: &str,
    expires_at: Option<Millis>,
    now: Millis,
) -> (User, Vec<ChangeEvent>) {
    let mut events = Vec::new();
    let existing = t.account_by_provider(DISCORD_PROVIDER, &profile.id).cloned();
    let user_id = existing.as_ref().map(|a| a.user_id.clone()).unwrap_or_else(new_id);

    let name = Some(profile.display_name().to_string());
    let image = profile.avatar_url();
    let user = match t.users.get(&user_id).cloned() {
        Some(mut u) => {
            if u.name != name || u.email != profile.email || u.image != image {
                u.name = name;
                u.email = profile.email.clone();
                u.image = image;
                u.updated_at = now;
                events.push(ChangeEvent::user(ChangeKind::Updated, &u.id));
            }
            u
        }
        None => User {
            id: user_id.clone(),
            email: profile.email.clone(),
            name,
            image,
            role: Role::User,
            discord_nickname: None,
            created_at: now,
            updated_at: now,
        },
    };
    t.users.insert(user.id.clone(), user.clone());

    let account = match existing {
        Some(mut a) => {
            a.access_token = Some(token.to_string());
            a.access_token_expires_at = expires_at;
            a.updated_at = now;
            a
        }
        None => Account {
            id: new_id(),
            user_id: user.id.clone(),
            provider_id: DISCORD_PROVIDER.to_string(),
            account_id: profile.id.clone(),
            access_token: Some(token.to_string()),
            access_token_expires_at: expires_at,
            created_at: now,
            updated_at: now,
        },
    };
    t.accounts.insert(account.id.clone(), account);
    (user, events)
}
