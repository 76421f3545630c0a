//!
//! armory client library
//! ---------------------
//! Client-side half of the sync and gating logic:
//! - `ApiClient`: cookie + CSRF session against the HTTP API.
//! - `ChangeDetector`: polls the data-status endpoint and fires
//!   per-collection callbacks on change.
//! - `PushClient` / `PushSubscriber`: pusher-protocol socket with
//!   per-component channel subscriptions invoking the same callbacks.
//! - `AccessGate`: once-per-session Discord role verification.

pub mod api;
pub mod detector;
pub mod gate;
pub mod handlers;
pub mod subscriber;

pub use api::ApiClient;
pub use detector::{ChangeDetector, DetectorConfig, DetectorHandle, StatusSource, TickOutcome};
pub use gate::{AccessGate, GateState, Navigation, RoleVerifier, VerifyResponse};
pub use handlers::ChangeHandlers;
pub use subscriber::{ConnectionState, PushClient, PushClientConfig, PushSubscriber};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
