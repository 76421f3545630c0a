//! Discord REST API (v10) client used for sign-in and guild role checks.
//!
//! Both calls are made with the user's own OAuth bearer token.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl DiscordUser {
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar
            .as_ref()
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{}.png", self.id, hash))
    }

    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildMember {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub nick: Option<String>,
}

impl GuildMember {
    pub fn has_role(&self, role_id: &str) -> bool {
        self.roles.iter().any(|r| r == role_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberLookup {
    Member(GuildMember),
    NotMember,
    /// Discord rejected the bearer token.
    TokenExpired,
}

#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// `GET /users/@me`. `Ok(None)` when the token is rejected.
    async fn current_user(&self, access_token: &str) -> AppResult<Option<DiscordUser>>;

    /// `GET /users/@me/guilds/{guild}/member`.
    async fn guild_member(&self, access_token: &str, guild_id: &str) -> AppResult<MemberLookup>;
}

pub struct DiscordHttpClient {
    base: String,
    client: reqwest::Client,
}

impl DiscordHttpClient {
    pub fn new(base: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("armory/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::internal("discord_client", e.to_string()))?;
        Ok(Self { base: base.into().trim_end_matches('/').to_string(), client })
    }

    async fn get(&self, access_token: &str, path: &str) -> AppResult<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        debug!(url = %url, "discord_request");
        self.client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::transport("discord_unreachable", e.to_string()))
    }
}

fn unexpected(status: StatusCode, what: &str) -> AppError {
    AppError::transport("discord_status", format!("Discord answered {} for {}", status, what))
}

#[async_trait]
impl DiscordApi for DiscordHttpClient {
    async fn current_user(&self, access_token: &str) -> AppResult<Option<DiscordUser>> {
        let resp = self.get(access_token, "/users/@me").await?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<DiscordUser>()
                .await
                .map(Some)
                .map_err(|e| AppError::transport("discord_bad_payload", e.to_string())),
            StatusCode::UNAUTHORIZED => Ok(None),
            other => Err(unexpected(other, "/users/@me")),
        }
    }

    async fn guild_member(&self, access_token: &str, guild_id: &str) -> AppResult<MemberLookup> {
        let path = format!("/users/@me/guilds/{}/member", urlencoding::encode(guild_id));
        let resp = self.get(access_token, &path).await?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<GuildMember>()
                .await
                .map(MemberLookup::Member)
                .map_err(|e| AppError::transport("discord_bad_payload", e.to_string())),
            StatusCode::UNAUTHORIZED => Ok(MemberLookup::TokenExpired),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(MemberLookup::NotMember),
            other => Err(unexpected(other, "guild member lookup")),
        }
    }
}
