use std::time::Duration;

use base64::Engine;

use super::principal::Principal;
use crate::error::{AppError, AppResult};
use crate::model::{now_millis, Millis, SessionRow};
use crate::storage::SharedStore;
use crate::tprintln;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    pub token: String,
    pub csrf: String,
    pub expires_at: Millis,
}

/// A valid session together with the principal it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub token: String,
    pub csrf: String,
    pub principal: Principal,
    pub expires_at: Millis,
}

fn gen_id() -> AppResult<String> {
    // 256-bit random token base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| AppError::internal("rng_unavailable", e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Session rows live in the store so they survive restarts and can be
/// revoked together with the rest of a user's data.
#[derive(Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    store: SharedStore,
}

impl SessionManager {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { ttl, store }
    }

    pub fn issue(&self, user_id: &str) -> AppResult<IssuedSession> {
        let token = gen_id()?;
        let csrf = gen_id()?;
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = self.store.transact(|t, now| {
            if !t.users.contains_key(user_id) {
                return Err(AppError::not_found("user_not_found", format!("no user {}", user_id)));
            }
            let expires_at = now.saturating_add(ttl_ms);
            t.sessions.insert(
                token.clone(),
                SessionRow { token: token.clone(), user_id: user_id.to_string(), csrf: csrf.clone(), created_at: now, expires_at },
            );
            Ok(expires_at)
        })?;
        tprintln!("session.issue user={} ttl_secs={}", user_id, self.ttl.as_secs());
        Ok(IssuedSession { token, csrf, expires_at })
    }

    /// The live session for `token`; expired rows are dropped on sight.
    pub fn validate(&self, token: &str) -> Option<ActiveSession> {
        let now = now_millis();
        let (found, expired) = self.store.read(|t| {
            let Some(row) = t.sessions.get(token) else { return (None, false) };
            if row.expires_at <= now {
                return (None, true);
            }
            let active = t.users.get(&row.user_id).map(|user| ActiveSession {
                token: row.token.clone(),
                csrf: row.csrf.clone(),
                principal: Principal::from_user(user),
                expires_at: row.expires_at,
            });
            (active, false)
        });
        if expired {
            if let Err(e) = self.logout(token) {
                tracing::warn!("failed to drop expired session: {}", e);
            }
        }
        found
    }

    pub fn logout(&self, token: &str) -> AppResult<bool> {
        if !self.store.read(|t| t.sessions.contains_key(token)) {
            return Ok(false);
        }
        self.store.transact(|t, _| Ok(t.sessions.remove(token).is_some()))
    }

    pub fn prune_expired(&self) -> AppResult<usize> {
        let now = now_millis();
        if !self.store.read(|t| t.sessions.values().any(|s| s.expires_at <= now)) {
            return Ok(0);
        }
        self.store.transact(|t, _| {
            let before = t.sessions.len();
            t.sessions.retain(|_, s| s.expires_at > now);
            Ok(before - t.sessions.len())
        })
    }
}
