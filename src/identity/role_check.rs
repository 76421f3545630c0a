//! Server side of the Discord role check.
//!
//! Expired tokens only cost the user their sessions. A missing membership or
//! role revokes the sessions too and, unless turned off, deprovisions the
//! identity.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RoleRequirement;
use crate::discord::{DiscordApi, MemberLookup};
use crate::error::{AppError, AppResult};
use crate::inventory::deprovision_user;
use crate::model::now_millis;
use crate::push::{ChangeEvent, ChangeKind};
use crate::storage::SharedStore;

pub const EXPIRED_MESSAGE: &str = "Your Discord session has expired. Please sign in again.";
pub const NOT_MEMBER_MESSAGE: &str = "You must be a member of the required Discord server to access this application.";
pub const MISSING_ROLE_MESSAGE: &str = "You do not have the required Discord role to access this application.";

fn is_false(v: &bool) -> bool {
    !*v
}

/// Response body of the role check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCheckResult {
    pub has_role: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub token_expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleVerdict {
    Verified,
    /// No guild/role requirement configured; everyone passes.
    NotConfigured,
    Expired { message: String },
    Denied { message: String },
}

impl RoleVerdict {
    pub fn http_status(&self) -> u16 {
        match self {
            RoleVerdict::Verified | RoleVerdict::NotConfigured => 200,
            RoleVerdict::Expired { .. } => 401,
            RoleVerdict::Denied { .. } => 403,
        }
    }

    pub fn result(&self) -> RoleCheckResult {
        match self {
            RoleVerdict::Verified | RoleVerdict::NotConfigured => {
                RoleCheckResult { has_role: true, token_expired: false, message: None }
            }
            RoleVerdict::Expired { message } => {
                RoleCheckResult { has_role: false, token_expired: true, message: Some(message.clone()) }
            }
            RoleVerdict::Denied { message } => {
                RoleCheckResult { has_role: false, token_expired: false, message: Some(message.clone()) }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleCheckOutcome {
    pub verdict: RoleVerdict,
    /// Events to publish for rows touched by the check.
    pub events: Vec<ChangeEvent>,
}

impl RoleCheckOutcome {
    fn quiet(verdict: RoleVerdict) -> Self {
        Self { verdict, events: Vec::new() }
    }
}

pub async fn verify_member_role(
    store: &SharedStore,
    discord: &dyn DiscordApi,
    requirement: Option<&RoleRequirement>,
    user_id: &str,
    deprovision_on_denied: bool,
) -> AppResult<RoleCheckOutcome> {
    let Some(account) = store.read(|t| t.discord_account_for(user_id).cloned()) else {
        return Err(AppError::not_found("no_discord_account", "No Discord account found"));
    };
    let Some(requirement) = requirement else {
        warn!(user = %user_id, "discord role requirement not configured, allowing access");
        return Ok(RoleCheckOutcome::quiet(RoleVerdict::NotConfigured));
    };

    let usable_token = account
        .access_token
        .as_deref()
        .filter(|tok| !tok.is_empty())
        .filter(|_| account.access_token_expires_at.map_or(true, |exp| exp > now_millis()));
    let Some(token) = usable_token else {
        return expire(store, user_id);
    };

    let member = match discord.guild_member(token, &requirement.guild_id).await? {
        MemberLookup::TokenExpired => return expire(store, user_id),
        MemberLookup::NotMember => return deny(store, user_id, NOT_MEMBER_MESSAGE, deprovision_on_denied),
        MemberLookup::Member(m) if !m.has_role(&requirement.role_id) => {
            return deny(store, user_id, MISSING_ROLE_MESSAGE, deprovision_on_denied)
        }
        MemberLookup::Member(m) => m,
    };

    // Keep the guild nickname current while we have it.
    let events = match member.nick.filter(|n| !n.is_empty()) {
        Some(nick) => store.transact(|t, now| {
            let Some(u) = t.users.get_mut(user_id) else { return Ok(Vec::new()) };
            if u.discord_nickname.as_deref() == Some(nick.as_str()) {
                return Ok(Vec::new());
            }
            u.discord_nickname = Some(nick.clone());
            u.updated_at = now;
            Ok(vec![ChangeEvent::user(ChangeKind::Updated, user_id)])
        })?,
        None => Vec::new(),
    };
    info!(user = %user_id, guild = %requirement.guild_id, "discord_role_verified");
    Ok(RoleCheckOutcome { verdict: RoleVerdict::Verified, events })
}

fn expire(store: &SharedStore, user_id: &str) -> AppResult<RoleCheckOutcome> {
    let revoked = store.transact(|t, _| Ok(t.delete_sessions_of(user_id)))?;
    warn!(user = %user_id, revoked, "discord token expired, sessions revoked");
    Ok(RoleCheckOutcome::quiet(RoleVerdict::Expired { message: EXPIRED_MESSAGE.to_string() }))
}

fn deny(store: &SharedStore, user_id: &str, message: &str, deprovision: bool) -> AppResult<RoleCheckOutcome> {
    let events = store.transact(|t, now| {
        if deprovision {
            Ok(deprovision_user(t, user_id, now))
        } else {
            t.delete_sessions_of(user_id);
            Ok(Vec::new())
        }
    })?;
    warn!(user = %user_id, deprovision, "discord role check denied: {}", message);
    Ok(RoleCheckOutcome { verdict: RoleVerdict::Denied { message: message.to_string() }, events })
}
