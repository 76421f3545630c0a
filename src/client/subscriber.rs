//! Push subscription over the pusher channels socket.
//!
//! `PushClient` owns the connection: it reconnects with exponential backoff
//! and resubscribes every registered channel after each reconnect.
//! `PushSubscriber` is one component's set of bindings on that connection.
//! Several subscribers may share a channel; the wire subscribe goes out once
//! and the wire unsubscribe when the last of them leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::handlers::ChangeHandlers;
use super::{SyncError, SyncResult};
use crate::push::protocol::{self, parse_frame, Frame};
use crate::push::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Unavailable,
    Failed,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unavailable => "unavailable",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PushClientConfig {
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl PushClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_retries: None,
        }
    }

    /// Socket URL of the local hub served by an armory server at `base`.
    pub fn local(base: &str, key: &str) -> SyncResult<Self> {
        let mut ws = Url::parse(base).map_err(|e| SyncError::Config(format!("invalid base URL {}: {}", base, e)))?;
        let scheme = if ws.scheme() == "https" { "wss" } else { "ws" };
        ws.set_scheme(scheme).map_err(|_| SyncError::Config(format!("cannot derive socket URL from {}", base)))?;
        ws.set_path(&format!("/app/{}", urlencoding::encode(key)));
        ws.set_query(Some(&format!("protocol={}&client=armory-rs", protocol::PROTOCOL_VERSION)));
        Ok(Self::new(ws.to_string()))
    }
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Vec<(u64, ChangeHandlers)>>,
    next_id: u64,
    /// Sender into the live socket; `None` while disconnected.
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

impl Registry {
    fn send(&self, frame: Frame) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(frame);
        }
    }
}

struct Inner {
    config: PushClientConfig,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "push_state");
        }
    }

    fn on_established(&self, tx: mpsc::UnboundedSender<Frame>) {
        let mut reg = self.registry.lock();
        for channel in reg.channels.keys() {
            let _ = tx.send(Frame::subscribe(channel));
        }
        reg.outbound = Some(tx);
        drop(reg);
        self.set_state(ConnectionState::Connected);
    }

    fn on_lost(&self) {
        self.registry.lock().outbound = None;
    }
}

/// Shared connection handle. Cheap to clone.
#[derive(Clone)]
pub struct PushClient {
    inner: Arc<Inner>,
}

impl PushClient {
    pub fn new(config: PushClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Initialized);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                state,
                closed: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the connection task unless it is already running.
    pub fn acquire(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(connection_loop(self.inner.clone())));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Close the socket and stop reconnecting. Registered bindings stay but
    /// receive nothing further.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.on_lost();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.registry.lock().channels.contains_key(channel)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.registry.lock().channels.get(channel).map_or(0, |v| v.len())
    }

    fn subscribe(&self, channel: &str, handlers: ChangeHandlers) -> u64 {
        let mut reg = self.inner.registry.lock();
        reg.next_id += 1;
        let id = reg.next_id;
        let first = !reg.channels.contains_key(channel);
        reg.channels.entry(channel.to_string()).or_default().push((id, handlers));
        if first {
            reg.send(Frame::subscribe(channel));
        }
        id
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut reg = self.inner.registry.lock();
        let Some(bindings) = reg.channels.get_mut(channel) else { return };
        bindings.retain(|(bid, _)| *bid != id);
        if bindings.is_empty() {
            reg.channels.remove(channel);
            reg.send(Frame::unsubscribe(channel));
        }
    }

    /// Hand one event to every binding on `channel`. Returns the number of
    /// callbacks invoked. Unknown channels or event names are ignored.
    pub fn deliver(&self, channel: &str, event: &str, payload: &serde_json::Value) -> usize {
        let Some(change) = ChangeEvent::parse(channel, event, payload) else {
            debug!(channel, event, "push_event_ignored");
            return 0;
        };
        let bound: Vec<ChangeHandlers> = {
            let reg = self.inner.registry.lock();
            reg.channels.get(channel).map(|v| v.iter().map(|(_, h)| h.clone()).collect()).unwrap_or_default()
        };
        bound.iter().filter(|h| h.fire(change.collection)).count()
    }

    #[cfg(test)]
    fn inject_outbound(&self, tx: mpsc::UnboundedSender<Frame>) {
        self.inner.on_established(tx);
    }
}

async fn connection_loop(inner: Arc<Inner>) {
    let mut failures: u32 = 0;
    let mut backoff = inner.config.initial_backoff;
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        let request = match inner.config.url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                warn!("push socket URL {} rejected: {}", inner.config.url, e);
                inner.set_state(ConnectionState::Failed);
                return;
            }
        };
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _resp)) => {
                if drive_socket(&inner, stream).await {
                    failures = 0;
                    backoff = inner.config.initial_backoff;
                }
            }
            Err(e) => warn!("push socket connect failed: {}", e),
        }
        inner.on_lost();
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        failures += 1;
        if inner.config.max_retries.is_some_and(|max| failures > max) {
            warn!("push socket giving up after {} attempts", failures);
            inner.set_state(ConnectionState::Failed);
            return;
        }
        inner.set_state(ConnectionState::Unavailable);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(inner.config.max_backoff);
    }
    inner.set_state(ConnectionState::Disconnected);
}

/// Pump one socket until it drops. True when the handshake completed.
async fn drive_socket<S>(inner: &Arc<Inner>, stream: tokio_tungstenite::WebSocketStream<S>) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let client = PushClient { inner: inner.clone() };
    let mut established = false;
    loop {
        tokio::select! {
            out = rx.recv() => {
                let Some(frame) = out else { break };
                if sink.send(Message::Text(frame.to_text())).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Some(frame) = parse_frame(&text) else { continue };
                        match frame.event.as_str() {
                            protocol::CONNECTION_ESTABLISHED => {
                                established = true;
                                info!("push socket connected");
                                inner.on_established(tx.clone());
                            }
                            protocol::PING => {
                                let _ = tx.send(Frame::new(protocol::PONG, None, serde_json::json!({})));
                            }
                            protocol::PONG => {}
                            protocol::SUBSCRIPTION_SUCCEEDED => {
                                debug!(channel = ?frame.channel, "push_subscribed");
                            }
                            protocol::ERROR => warn!("push socket error frame: {}", frame.decoded_data()),
                            event => {
                                if let Some(channel) = frame.channel.as_deref() {
                                    let fired = client.deliver(channel, event, &frame.decoded_data());
                                    debug!(channel, event, fired, "push_event");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("push socket read failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    established
}

/// One component's bindings. Subscribing is idempotent per channel; dropping
/// the subscriber unsubscribes everything it bound.
pub struct PushSubscriber {
    client: PushClient,
    handlers: ChangeHandlers,
    bindings: Vec<(String, u64)>,
}

impl PushSubscriber {
    pub fn new(client: &PushClient, handlers: ChangeHandlers) -> Self {
        Self { client: client.clone(), handlers, bindings: Vec::new() }
    }

    /// Bind every collection that has a callback.
    pub fn attach(&mut self) {
        for collection in self.handlers.bound() {
            let channel = collection.channel();
            if self.bindings.iter().any(|(c, _)| c == channel) {
                continue;
            }
            let id = self.client.subscribe(channel, self.handlers.clone());
            self.bindings.push((channel.to_string(), id));
        }
    }

    pub fn detach(&mut self) {
        for (channel, id) in self.bindings.drain(..) {
            self.client.unsubscribe(&channel, id);
        }
    }

    pub fn channels(&self) -> Vec<&str> {
        self.bindings.iter().map(|(c, _)| c.as_str()).collect()
    }
}

impl Drop for PushSubscriber {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let n = Arc::new(AtomicUsize::new(0));
        let m = n.clone();
        (n, move || {
            m.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push((f.event.clone(), f.data_channel()));
        }
        out
    }

    #[test]
    fn duplicate_delivery_fires_twice() {
        let client = PushClient::new(PushClientConfig::new("ws://127.0.0.1:1/app/k"));
        let (hits, cb) = counter();
        let mut sub = PushSubscriber::new(&client, ChangeHandlers::new().on_weapons(cb));
        sub.attach();

        let payload = serde_json::json!({"id": "w1"});
        assert_eq!(client.deliver("weapons", "weapon-updated", &payload), 1);
        assert_eq!(client.deliver("weapons", "weapon-updated", &payload), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Unbound event names and channels do nothing.
        assert_eq!(client.deliver("weapons", "weapon-type-updated", &payload), 0);
        assert_eq!(client.deliver("users", "user-deleted", &payload), 0);
    }

    #[test]
    fn attach_is_idempotent_per_channel() {
        let client = PushClient::new(PushClientConfig::new("ws://127.0.0.1:1/app/k"));
        let (_hits, cb) = counter();
        let mut sub = PushSubscriber::new(&client, ChangeHandlers::new().on_users(cb));
        sub.attach();
        sub.attach();
        assert_eq!(client.subscriber_count("users"), 1);
        assert_eq!(sub.channels(), vec!["users"]);
    }

    #[test]
    fn co_subscribers_keep_independent_callbacks() {
        let client = PushClient::new(PushClientConfig::new("ws://127.0.0.1:1/app/k"));
        let (a_hits, a) = counter();
        let (b_hits, b) = counter();
        let mut first = PushSubscriber::new(&client, ChangeHandlers::new().on_weapon_types(a));
        let mut second = PushSubscriber::new(&client, ChangeHandlers::new().on_weapon_types(b));
        first.attach();
        second.attach();

        assert_eq!(client.deliver("weapon-types", "weapon-type-created", &serde_json::json!({"id": "t"})), 2);
        drop(first);
        assert_eq!(client.deliver("weapon-types", "weapon-type-deleted", &serde_json::json!({})), 1);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 2);
        second.detach();
        assert!(!client.is_subscribed("weapon-types"));
    }

    #[test]
    fn wire_subscribe_once_and_unsubscribe_on_last_leave() {
        let client = PushClient::new(PushClientConfig::new("ws://127.0.0.1:1/app/k"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.inject_outbound(tx);
        assert_eq!(client.state(), ConnectionState::Connected);

        let (_h1, a) = counter();
        let (_h2, b) = counter();
        let mut first = PushSubscriber::new(&client, ChangeHandlers::new().on_weapons(a));
        let mut second = PushSubscriber::new(&client, ChangeHandlers::new().on_weapons(b));
        first.attach();
        second.attach();
        assert_eq!(drain(&mut rx), vec![(protocol::SUBSCRIBE.to_string(), Some("weapons".to_string()))]);

        first.detach();
        assert!(drain(&mut rx).is_empty());
        second.detach();
        assert_eq!(drain(&mut rx), vec![(protocol::UNSUBSCRIBE.to_string(), Some("weapons".to_string()))]);
    }

    #[test]
    fn reconnect_resubscribes_registered_channels() {
        let client = PushClient::new(PushClientConfig::new("ws://127.0.0.1:1/app/k"));
        let (_h, cb) = counter();
        let (_h2, cb2) = counter();
        let mut sub = PushSubscriber::new(&client, ChangeHandlers::new().on_users(cb).on_weapons(cb2));
        sub.attach();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.inject_outbound(tx);
        let mut got: Vec<_> = drain(&mut rx).into_iter().filter_map(|(_, ch)| ch).collect();
        got.sort();
        assert_eq!(got, vec!["users".to_string(), "weapons".to_string()]);
    }

    #[test]
    fn local_socket_url_from_http_base() {
        let cfg = PushClientConfig::local("http://127.0.0.1:7878", "armory-local").unwrap();
        assert!(cfg.url.starts_with("ws://127.0.0.1:7878/app/armory-local?protocol=7"));
        let tls = PushClientConfig::local("https://armory.example", "k").unwrap();
        assert!(tls.url.starts_with("wss://armory.example/app/k"));
    }

    #[tokio::test]
    async fn invalid_url_fails_without_retrying() {
        let client = PushClient::new(PushClientConfig::new("not a socket url"));
        let mut states = client.state_watch();
        client.acquire();
        let reached = tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == ConnectionState::Failed))
            .await
            .map(|r| r.is_ok());
        assert_eq!(reached, Ok(true));
    }

    #[tokio::test]
    async fn shutdown_reports_disconnected() {
        let client = PushClient::new(PushClientConfig {
            initial_backoff: Duration::from_millis(10),
            ..PushClientConfig::new("ws://127.0.0.1:1/app/k")
        });
        client.acquire();
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.shutdown();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.acquire();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
