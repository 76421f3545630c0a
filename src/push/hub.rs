//! In-process push hub.
//!
//! Published events fan out over a broadcast channel to every WebSocket
//! connected on `/app/{key}`; each socket forwards only the channels it has
//! subscribed to.

use std::collections::HashSet;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::protocol::{self, parse_frame, Frame};
use super::PushTransport;
use crate::error::AppResult;

#[derive(Debug, Clone)]
pub struct HubMessage {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct LocalHub {
    key: String,
    tx: broadcast::Sender<HubMessage>,
}

impl LocalHub {
    pub fn new(key: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { key: key.into(), tx }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of connected sockets.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn receiver(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PushTransport for LocalHub {
    async fn trigger(&self, channel: &str, event: &str, payload: &serde_json::Value) -> AppResult<()> {
        let msg = HubMessage { channel: channel.to_string(), event: event.to_string(), payload: payload.clone() };
        // No connected sockets is not an error.
        let delivered = self.tx.send(msg).unwrap_or(0);
        debug!(channel, event, sockets = delivered, "hub_published");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Frame) -> bool {
    socket.send(Message::Text(frame.to_text().into())).await.is_ok()
}

/// Drive one subscriber socket until it closes.
pub async fn serve_socket(mut socket: WebSocket, hub: LocalHub) {
    let socket_id = format!("{}.{}", std::process::id(), crate::model::new_id());
    let hello = Frame::encoded(
        protocol::CONNECTION_ESTABLISHED,
        None,
        &serde_json::json!({ "socket_id": socket_id, "activity_timeout": 120 }),
    );
    if !send_frame(&mut socket, hello).await {
        return;
    }
    let mut rx = hub.receiver();
    let mut channels: HashSet<String> = HashSet::new();
    debug!(socket_id = %socket_id, "hub_socket_open");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        let Some(frame) = parse_frame(text.as_str()) else { continue };
                        let reply = match frame.event.as_str() {
                            protocol::SUBSCRIBE => frame.data_channel().map(|ch| {
                                channels.insert(ch.clone());
                                Frame::encoded(protocol::SUBSCRIPTION_SUCCEEDED, Some(&ch), &serde_json::json!({}))
                            }),
                            protocol::UNSUBSCRIBE => {
                                if let Some(ch) = frame.data_channel() { channels.remove(&ch); }
                                None
                            }
                            protocol::PING => Some(Frame::encoded(protocol::PONG, None, &serde_json::json!({}))),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            if !send_frame(&mut socket, reply).await { break; }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            published = rx.recv() => {
                match published {
                    Ok(m) => {
                        if channels.contains(&m.channel) {
                            let frame = Frame::encoded(&m.event, Some(&m.channel), &m.payload);
                            if !send_frame(&mut socket, frame).await { break; }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(socket_id = %socket_id, skipped, "hub_socket_lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!(socket_id = %socket_id, "hub_socket_closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_without_sockets_is_ok() {
        let hub = LocalHub::new("local");
        assert_eq!(hub.receiver_count(), 0);
        hub.trigger("weapons", "weapon-created", &serde_json::json!({"id": "w1"})).await.unwrap();
    }

    #[tokio::test]
    async fn trigger_reaches_receivers() {
        let hub = LocalHub::new("local");
        let mut rx = hub.receiver();
        hub.trigger("users", "user-deleted", &serde_json::json!({})).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, "users");
        assert_eq!(got.event, "user-deleted");
    }
}
