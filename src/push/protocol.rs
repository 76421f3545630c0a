//! The subset of the Pusher channels WebSocket protocol spoken by the local hub
//! and the push client.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 7;

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";

/// One text frame. Server-to-client `data` is a JSON-encoded string;
/// client-to-server `data` is an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: &str, channel: Option<&str>, data: serde_json::Value) -> Self {
        Self { event: event.to_string(), channel: channel.map(|c| c.to_string()), data }
    }

    /// Server-side frame with the payload encoded as a string.
    pub fn encoded(event: &str, channel: Option<&str>, payload: &serde_json::Value) -> Self {
        Self::new(event, channel, serde_json::Value::String(payload.to_string()))
    }

    pub fn subscribe(channel: &str) -> Self {
        Self::new(SUBSCRIBE, None, serde_json::json!({ "channel": channel }))
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(UNSUBSCRIBE, None, serde_json::json!({ "channel": channel }))
    }

    /// `data` as a JSON value whichever way it was sent.
    pub fn decoded_data(&self) -> serde_json::Value {
        match &self.data {
            serde_json::Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            other => other.clone(),
        }
    }

    /// Channel named inside `data`, as used by subscribe/unsubscribe.
    pub fn data_channel(&self) -> Option<String> {
        self.decoded_data().get("channel").and_then(|c| c.as_str()).map(|s| s.to_string())
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event\":\"{}\"}}", ERROR))
    }
}

pub fn parse_frame(text: &str) -> Option<Frame> {
    serde_json::from_str(text).ok()
}
