//!
//! armory push notifier
//! --------------------
//! Server-side publisher of change events. Handlers call `publish_change`
//! after their mutation has committed; delivery is best-effort and failures
//! never reach the caller.
//!
//! The transport is built lazily on first use and cached for the life of the
//! process; `shutdown()` turns every later publish into a no-op. With no
//! configured backend, publishing returns immediately without touching the
//! network and clients fall back to polling or manual refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::error::AppResult;

pub mod events;
pub mod hub;
pub mod protocol;
pub mod pusher;

pub use events::{ChangeEvent, ChangeKind};
pub use hub::LocalHub;
pub use pusher::{PusherCredentials, PusherRestTransport};

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn trigger(&self, channel: &str, event: &str, payload: &serde_json::Value) -> AppResult<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PushConfig {
    #[default]
    Disabled,
    Pusher(PusherCredentials),
    /// In-process hub served on `/app/{key}`.
    Local { key: String },
}

pub struct PushNotifier {
    config: PushConfig,
    hub: Option<LocalHub>,
    transport: OnceCell<Option<Arc<dyn PushTransport>>>,
    closed: AtomicBool,
}

impl PushNotifier {
    pub fn new(config: PushConfig) -> Self {
        let hub = match &config {
            PushConfig::Local { key } => Some(LocalHub::new(key.clone())),
            _ => None,
        };
        Self { config, hub, transport: OnceCell::new(), closed: AtomicBool::new(false) }
    }

    pub fn disabled() -> Self {
        Self::new(PushConfig::Disabled)
    }

    /// Notifier over an already-built transport.
    pub fn with_transport(transport: Arc<dyn PushTransport>) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(Some(transport));
        Self { config: PushConfig::Disabled, hub: None, transport: cell, closed: AtomicBool::new(false) }
    }

    /// Hub to mount on the HTTP router when the local backend is configured.
    pub fn local_hub(&self) -> Option<&LocalHub> {
        self.hub.as_ref()
    }

    /// The process-wide transport, built on first call. `None` when push is off or shut down.
    pub fn acquire(&self) -> Option<Arc<dyn PushTransport>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.transport.get_or_init(|| self.build()).clone()
    }

    fn build(&self) -> Option<Arc<dyn PushTransport>> {
        match &self.config {
            PushConfig::Disabled => {
                warn!("push notifier not configured, real-time updates disabled");
                None
            }
            PushConfig::Pusher(creds) => match PusherRestTransport::new(creds.clone()) {
                Ok(t) => {
                    info!(app_id = %creds.app_id, cluster = %creds.cluster, "push notifier using pusher");
                    Some(Arc::new(t))
                }
                Err(e) => {
                    error!("push notifier could not build pusher transport: {}", e);
                    None
                }
            },
            PushConfig::Local { key } => {
                info!(key = %key, "push notifier using local hub");
                self.hub.clone().map(|h| Arc::new(h) as Arc<dyn PushTransport>)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.acquire().is_some()
    }

    pub async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let Some(transport) = self.acquire() else { return };
        match transport.trigger(channel, event, &payload).await {
            Ok(()) => debug!(transport = transport.name(), channel, event, "push_published"),
            Err(e) => warn!(transport = transport.name(), channel, event, "push publish failed: {}", e),
        }
    }

    pub async fn publish_change(&self, event: &ChangeEvent) {
        self.publish(event.channel(), &event.event_name(), event.payload()).await;
    }

    pub async fn publish_all(&self, events: &[ChangeEvent]) {
        for ev in events {
            self.publish_change(ev).await;
        }
    }

    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("push notifier shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String, serde_json::Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl PushTransport for Recorder {
        async fn trigger(&self, channel: &str, event: &str, payload: &serde_json::Value) -> AppResult<()> {
            self.seen.lock().push((channel.into(), event.into(), payload.clone()));
            if self.fail {
                return Err(AppError::transport("down", "unreachable"));
            }
            Ok(())
        }
        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn unconfigured_publish_is_a_silent_noop() {
        let notifier = PushNotifier::new(PushConfig::Disabled);
        assert!(notifier.acquire().is_none());
        notifier.publish("weapons", "weapon-created", serde_json::json!({"id": "w1"})).await;
        notifier.publish_change(&ChangeEvent::user(ChangeKind::Deleted, "u1")).await;
        assert!(!notifier.is_active());
    }

    #[tokio::test]
    async fn publish_change_uses_channel_event_and_payload() {
        let rec = Arc::new(Recorder::default());
        let notifier = PushNotifier::with_transport(rec.clone());
        notifier.publish_change(&ChangeEvent::weapon_type(ChangeKind::Created, "t1")).await;
        let seen = rec.seen.lock().clone();
        assert_eq!(seen, vec![("weapon-types".to_string(), "weapon-type-created".to_string(), serde_json::json!({"id": "t1"}))]);
    }

    #[tokio::test]
    async fn transport_failure_is_swallowed() {
        let rec = Arc::new(Recorder { fail: true, ..Default::default() });
        let notifier = PushNotifier::with_transport(rec.clone());
        notifier.publish("users", "user-updated", serde_json::json!({})).await;
        assert_eq!(rec.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_publishing() {
        let rec = Arc::new(Recorder::default());
        let notifier = PushNotifier::with_transport(rec.clone());
        notifier.shutdown();
        notifier.publish("users", "user-updated", serde_json::json!({})).await;
        assert!(rec.seen.lock().is_empty());
        assert!(notifier.acquire().is_none());
    }

    #[test]
    fn acquire_returns_the_same_handle() {
        let notifier = PushNotifier::new(PushConfig::Local { key: "local".into() });
        let a = notifier.acquire().unwrap();
        let b = notifier.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "local");
        assert!(notifier.local_hub().is_some());
    }
}
