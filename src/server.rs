//!
//! armory HTTP/WS server
//! ---------------------
//! This module defines the Axum-based HTTP API of armory.
//!
//! Responsibilities:
//! - Session management with a cookie + CSRF token model.
//! - Sign-in with a Discord access token and the Discord role check.
//! - CRUD endpoints for weapons, weapon types, users and the audit log.
//! - The data-status endpoint polled by clients for change detection.
//! - Publishing change events after each committed mutation, and mounting
//!   the local push hub socket when that backend is configured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{ws::WebSocketUpgrade, Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::discord::{DiscordApi, DiscordHttpClient};
use crate::error::{AppError, AppResult};
use crate::identity::{ActiveSession, SessionManager};
use crate::push::{hub, ChangeEvent, PushConfig, PushNotifier};
use crate::status::CollectionClock;
use crate::storage::SharedStore;

pub mod auth;
pub mod logs;
pub mod status;
pub mod users;
pub mod verify;
pub mod weapon_types;
pub mod weapons;

pub const SESSION_COOKIE: &str = "armory_session";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub sessions: SessionManager,
    pub notifier: Arc<PushNotifier>,
    pub discord: Arc<dyn DiscordApi>,
    /// Source of the data-status document; the store itself unless replaced.
    pub clock: Arc<dyn CollectionClock>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, store: SharedStore, discord: Arc<dyn DiscordApi>, notifier: Arc<PushNotifier>) -> Self {
        let sessions = SessionManager::new(store.clone(), config.session_ttl);
        Self {
            clock: Arc::new(store.clone()),
            store,
            sessions,
            notifier,
            discord,
            config: Arc::new(config),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn CollectionClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Announce committed changes. Never fails.
    pub async fn publish(&self, events: &[ChangeEvent]) {
        self.notifier.publish_all(events).await;
    }
}

pub(crate) fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

pub(crate) fn set_session_cookie(token: &str, max_age: Duration) -> AppResult<HeaderValue> {
    // Secure, HttpOnly cookie scoped to path / with SameSite=Strict
    HeaderValue::from_str(&format!(
        "{}={}; Max-Age={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE,
        token,
        max_age.as_secs()
    ))
    .map_err(|e| AppError::internal("cookie_encoding", e.to_string()))
}

pub(crate) fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static(
        "armory_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
    )
}

/// The caller's session, or 401.
pub(crate) fn current_session(state: &AppState, headers: &HeaderMap) -> AppResult<ActiveSession> {
    parse_cookie(headers, SESSION_COOKIE)
        .and_then(|token| state.sessions.validate(&token))
        .ok_or_else(|| AppError::auth("unauthorized", "Unauthorized"))
}

/// The caller's session with a matching CSRF header; required for every mutation.
pub(crate) fn mutating_session(state: &AppState, headers: &HeaderMap) -> AppResult<ActiveSession> {
    let session = current_session(state, headers)?;
    let provided = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    if provided != Some(session.csrf.as_str()) {
        return Err(AppError::forbidden("invalid_csrf", "invalid csrf"));
    }
    Ok(session)
}

async fn push_socket(State(state): State<AppState>, Path(key): Path<String>, ws: WebSocketUpgrade) -> Response {
    let Some(hub) = state.notifier.local_hub().cloned() else {
        return AppError::not_found("push_disabled", "push hub not enabled").into_response();
    };
    if key != hub.key() {
        return AppError::not_found("unknown_app_key", "unknown app key").into_response();
    }
    ws.on_upgrade(move |socket| hub::serve_socket(socket, hub))
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(|| async { "armory ok" }))
        .route("/api/data-status", get(status::data_status))
        .route("/api/verify-discord-role", post(verify::verify_discord_role))
        .route("/api/auth/sign-in", post(auth::sign_in))
        .route("/api/auth/sign-out", post(auth::sign_out))
        .route("/api/auth/session", get(auth::session))
        .route("/api/csrf", get(auth::csrf))
        .route("/api/weapons", get(weapons::list).post(weapons::create))
        .route("/api/weapons/assign", post(weapons::assign))
        .route("/api/weapons/return", post(weapons::return_weapon))
        .route("/api/weapons/{id}", get(weapons::get_one).patch(weapons::update).delete(weapons::delete))
        .route("/api/weapon-types", get(weapon_types::list).post(weapon_types::create))
        .route("/api/weapon-types/{id}", patch(weapon_types::update).delete(weapon_types::delete))
        .route("/api/users", get(users::list))
        .route("/api/users/{id}", patch(users::update).delete(users::delete))
        .route("/api/logs", get(logs::list));
    if state.notifier.local_hub().is_some() {
        app = app.route("/app/{key}", get(push_socket));
    }
    app.with_state(state)
}

fn log_startup(config: &AppConfig) {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "armory starting: RUST_LOG='{}', addr={}, data_file={:?}, session_ttl_secs={}, push={}, deprovision_on_denied={}",
        rust_log,
        config.addr(),
        config.data_file,
        config.session_ttl.as_secs(),
        config.push_backend(),
        config.deprovision_on_denied
    );
    match config.discord.requirement() {
        Some(req) => info!(target: "startup", "Discord role gate: guild={}, role={}", req.guild_id, req.role_id),
        None => warn!(target: "startup", "Discord role gate not configured, every signed-in user passes"),
    }
    if let PushConfig::Pusher(creds) = &config.push {
        info!(target: "startup", "push clients subscribe on {}", creds.socket_url());
    }
}

/// Start the armory HTTP server with the given configuration.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    log_startup(&config);

    let store = match &config.data_file {
        Some(path) => SharedStore::open(path).with_context(|| format!("While opening data file {}", path.display()))?,
        None => {
            warn!(target: "startup", "no data file configured, data lives in memory only");
            SharedStore::in_memory()
        }
    };
    let discord: Arc<dyn DiscordApi> = Arc::new(
        DiscordHttpClient::new(config.discord.api_base.clone()).context("While building the Discord client")?,
    );
    let notifier = Arc::new(PushNotifier::new(config.push.clone()));
    let addr = config.addr();
    let state = AppState::new(config, store, discord, notifier.clone());

    // Background sweeper for expired sessions
    {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                match sessions.prune_expired() {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "session_sweep"),
                    Err(e) => warn!("session sweep failed: {}", e),
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("While binding {}", addr))?;
    info!("Starting server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    notifier.shutdown();
    Ok(())
}
