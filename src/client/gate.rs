//! Once-per-session Discord role gate.
//!
//! The transition into `Checking` is the guard: exactly one caller wins it
//! and runs the verification, everyone else waits for the state it leaves
//! behind. A verdict belongs to the user it was computed for; asking for a
//! different user starts a fresh check. Waiters whose check was cancelled
//! try the claim again instead of waiting forever.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use super::SyncResult;
use crate::identity::RoleCheckResult;

pub const HOME_ROUTE: &str = "/";
pub const SIGN_IN_ROUTE: &str = "/api/auth/signin/discord";

const DENIED_FALLBACK: &str = "Access denied.";
const EXPIRED_FALLBACK: &str = "Your session has expired. Please sign in again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NotChecked,
    Checking,
    Verified,
    Denied { message: String },
    Expired { message: String },
    /// The check could not be completed; content renders anyway.
    Unverified,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateState::NotChecked | GateState::Checking)
    }

    pub fn renders_content(&self) -> bool {
        matches!(self, GateState::Verified | GateState::Unverified)
    }

    /// Only `Checking` shows the verification placeholder.
    pub fn is_blocking(&self) -> bool {
        matches!(self, GateState::Checking)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Stay,
    Home { message: String },
    SignIn,
}

impl Navigation {
    pub fn route(&self) -> Option<&'static str> {
        match self {
            Navigation::Stay => None,
            Navigation::Home { .. } => Some(HOME_ROUTE),
            Navigation::SignIn => Some(SIGN_IN_ROUTE),
        }
    }
}

/// Raw answer of the verify endpoint. 401 and 403 are answers, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResponse {
    pub status: u16,
    pub body: Option<RoleCheckResult>,
}

#[async_trait]
pub trait RoleVerifier: Send + Sync {
    async fn verify(&self, user_id: &str) -> SyncResult<VerifyResponse>;
}

fn classify(answer: SyncResult<VerifyResponse>) -> GateState {
    let resp = match answer {
        Ok(r) => r,
        Err(e) => {
            warn!("role verification failed, continuing unverified: {}", e);
            return GateState::Unverified;
        }
    };
    let message = |fallback: &str| {
        resp.body.as_ref().and_then(|b| b.message.clone()).unwrap_or_else(|| fallback.to_string())
    };
    match (resp.status, resp.body.as_ref()) {
        (200, Some(b)) if b.has_role => GateState::Verified,
        (200, Some(_)) | (403, _) => GateState::Denied { message: message(DENIED_FALLBACK) },
        (401, Some(b)) if b.token_expired => GateState::Expired { message: message(EXPIRED_FALLBACK) },
        (status, _) => {
            warn!(status, "unexpected role verification answer, continuing unverified");
            GateState::Unverified
        }
    }
}

/// Puts the gate back to `NotChecked` if the winning check is cancelled.
struct ClaimGuard<'a> {
    state: &'a watch::Sender<GateState>,
    done: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.send_replace(GateState::NotChecked);
        }
    }
}

pub struct AccessGate {
    verifier: Arc<dyn RoleVerifier>,
    state: watch::Sender<GateState>,
    /// User the current `Checking` or terminal state belongs to. Only touched
    /// inside `send_if_modified`/`send_modify` so it moves with the state.
    checked_for: Mutex<Option<String>>,
}

impl AccessGate {
    pub fn new(verifier: Arc<dyn RoleVerifier>) -> Self {
        let (state, _) = watch::channel(GateState::NotChecked);
        Self { verifier, state, checked_for: Mutex::new(None) }
    }

    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Run the check once per signed-in user. Without an identity nothing
    /// happens and the current state is returned.
    pub async fn ensure_checked(&self, user_id: Option<&str>) -> GateState {
        let Some(user_id) = user_id else {
            return self.state();
        };
        let mut rx = self.state.subscribe();
        loop {
            let mut settled = None;
            let claimed = self.state.send_if_modified(|s| {
                let mut owner = self.checked_for.lock();
                if *s == GateState::Checking {
                    return false;
                }
                if s.is_terminal() && owner.as_deref() == Some(user_id) {
                    settled = Some(s.clone());
                    return false;
                }
                *s = GateState::Checking;
                *owner = Some(user_id.to_string());
                true
            });
            if let Some(state) = settled {
                return state;
            }
            if claimed {
                return self.run_check(user_id).await;
            }
            // Someone else is checking; re-evaluate once they finish or give up.
            if rx.wait_for(|s| *s != GateState::Checking).await.is_err() {
                return self.state();
            }
        }
    }

    async fn run_check(&self, user_id: &str) -> GateState {
        let mut guard = ClaimGuard { state: &self.state, done: false };
        let next = classify(self.verifier.verify(user_id).await);
        guard.done = true;
        info!(user_id, state = ?next, "role gate resolved");
        self.state.send_replace(next.clone());
        next
    }

    pub fn navigation(&self) -> Navigation {
        match self.state() {
            GateState::Denied { message } => Navigation::Home { message },
            GateState::Expired { .. } => Navigation::SignIn,
            _ => Navigation::Stay,
        }
    }

    /// Forget the verdict, e.g. after signing out.
    pub fn reset(&self) {
        self.state.send_modify(|s| {
            *s = GateState::NotChecked;
            *self.checked_for.lock() = None;
        });
    }
}
