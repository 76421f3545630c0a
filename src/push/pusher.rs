//! Pusher channels HTTP API transport.
//!
//! Requests to `POST /apps/{app_id}/events` are signed with the
//! `auth_key`/`auth_timestamp`/`auth_version`/`body_md5` query and an
//! HMAC-SHA256 `auth_signature` over `METHOD\nPATH\nQUERY`.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::header::CONTENT_TYPE;
use sha2::Sha256;
use tracing::debug;

use super::PushTransport;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

pub const ENV_APP_ID: &str = "PUSHER_APP_ID";
pub const ENV_KEY: &str = "PUSHER_KEY";
pub const ENV_SECRET: &str = "PUSHER_SECRET";
pub const ENV_CLUSTER: &str = "PUSHER_CLUSTER";

#[derive(Clone, PartialEq, Eq)]
pub struct PusherCredentials {
    pub app_id: String,
    pub key: String,
    pub secret: String,
    pub cluster: String,
}

impl std::fmt::Debug for PusherCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherCredentials")
            .field("app_id", &self.app_id)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl PusherCredentials {
    /// All four values must be present and non-blank, otherwise push stays off.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let read = |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Some(Self {
            app_id: read(ENV_APP_ID)?,
            key: read(ENV_KEY)?,
            secret: read(ENV_SECRET)?,
            cluster: read(ENV_CLUSTER)?,
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn api_base(&self) -> String {
        format!("https://api-{}.pusher.com", self.cluster)
    }

    /// WebSocket endpoint clients subscribe on.
    pub fn socket_url(&self) -> String {
        socket_url_for_cluster(&self.cluster, &self.key)
    }
}

pub fn socket_url_for_cluster(cluster: &str, key: &str) -> String {
    format!(
        "wss://ws-{}.pusher.com/app/{}?protocol={}&client=armory-rs&version={}",
        cluster,
        key,
        super::protocol::PROTOCOL_VERSION,
        env!("CARGO_PKG_VERSION")
    )
}

pub fn body_md5(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// Query string (auth params plus `auth_signature`) for a signed request.
pub fn signed_query(secret: &str, key: &str, method: &str, path: &str, body: &[u8], timestamp: i64) -> AppResult<String> {
    // Keys are in alphabetical order, as the signature requires.
    let query = format!(
        "auth_key={}&auth_timestamp={}&auth_version=1.0&body_md5={}",
        key,
        timestamp,
        body_md5(body)
    );
    let to_sign = format!("{}\n{}\n{}", method, path, query);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::internal("pusher_signing", e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{}&auth_signature={}", query, signature))
}

pub struct PusherRestTransport {
    creds: PusherCredentials,
    base: String,
    client: reqwest::Client,
}

impl PusherRestTransport {
    pub fn new(creds: PusherCredentials) -> AppResult<Self> {
        let base = creds.api_base();
        Self::with_base(creds, base)
    }

    /// Point at a different API host (self-hosted or test endpoints).
    pub fn with_base(creds: PusherCredentials, base: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::internal("pusher_client", e.to_string()))?;
        Ok(Self { creds, base: base.into().trim_end_matches('/').to_string(), client })
    }
}

#[async_trait]
impl PushTransport for PusherRestTransport {
    async fn trigger(&self, channel: &str, event: &str, payload: &serde_json::Value) -> AppResult<()> {
        let path = format!("/apps/{}/events", self.creds.app_id);
        let body = serde_json::to_vec(&serde_json::json!({
            "name": event,
            "channels": [channel],
            "data": payload.to_string(),
        }))?;
        let query = signed_query(
            &self.creds.secret,
            &self.creds.key,
            "POST",
            &path,
            &body,
            chrono::Utc::now().timestamp(),
        )?;
        let url = format!("{}{}?{}", self.base, path, query);
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::transport("pusher_unreachable", e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::transport("pusher_rejected", format!("HTTP {}: {}", status, text)));
        }
        debug!(channel, event, "pusher_triggered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "pusher"
    }
}
